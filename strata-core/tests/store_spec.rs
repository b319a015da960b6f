use speculate2::speculate;

speculate! {
    use serde_json::json;
    use strata_core::models::*;
    use strata_core::{ContextError, Database, ErrorKind};

    fn store_with_project(id: &str) -> Database {
        let db = Database::open_memory().unwrap();
        db.create_project(&CreateProjectInput::new(id).with_id(id)).unwrap();
        db
    }

    describe "projects" {
        it "treats a repeated explicit id as a no-op" {
            let db = Database::open_memory().unwrap();
            let (first, created) = db
                .create_project(&CreateProjectInput::new("one").with_id("X"))
                .unwrap();
            let (second, again) = db
                .create_project(&CreateProjectInput::new("two").with_id("X"))
                .unwrap();

            assert_eq!(first, "X");
            assert_eq!(second, "X");
            assert!(created);
            assert!(!again);
            assert_eq!(db.list_projects().unwrap().len(), 1);
        }
    }

    describe "snapshots" {
        before {
            let db = store_with_project("P");
        }

        it "keeps each tier sorted by sequence number" {
            let tiers = [
                Priority::Critical, Priority::High, Priority::High, Priority::Medium,
                Priority::Critical, Priority::Low, Priority::High, Priority::Critical,
            ];
            for (n, priority) in tiers.iter().enumerate() {
                db.insert_snapshot(&NewSnapshot::new("P", json!({ "n": n })).priority(*priority))
                    .unwrap();
            }

            for priority in Priority::ALL {
                let rows = db.select_snapshots("P", priority, None).unwrap();
                assert!(rows.windows(2).all(|w| w[0].sequence_number < w[1].sequence_number));
                assert!(rows.iter().all(|s| s.priority == priority));
            }
            assert_eq!(db.count_snapshots("P", Priority::Critical, None).unwrap(), 3);
        }

        it "rejects unknown projects without writing" {
            let err = db
                .insert_snapshot(&NewSnapshot::new("missing", json!({"a": 1})))
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
            assert!(db.list_snapshots("missing").unwrap().is_empty());
            assert!(db.list_snapshots("P").unwrap().is_empty());
        }

        it "rejects tiers outside the closed set" {
            let err = Priority::parse("urgent").unwrap_err();
            assert!(matches!(err, ContextError::Validation(_)));
        }

        it "rejects malformed JSON payloads" {
            let err = NewSnapshot::from_json_str("P", "{\"open\": ").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }

        it "stores an empty project as empty tiers" {
            for priority in Priority::ALL {
                assert!(db.select_snapshots("P", priority, Some(1)).unwrap().is_empty());
            }
        }

        it "reports a missing snapshot as not found" {
            assert_eq!(db.get_snapshot(99).unwrap_err().kind(), ErrorKind::NotFound);
        }
    }

    describe "instances" {
        before {
            let db = store_with_project("P");
            let input = RegisterInstanceInput {
                instance_id: "I".to_string(),
                project_id: "P".to_string(),
                phase_id: None,
                hostname: "host".to_string(),
                process_id: 1,
            };
        }

        it "keeps a single active row across re-registration" {
            db.upsert_instance(&input).unwrap();
            db.upsert_instance(&input).unwrap();
            let rows = db.list_project_instances("P").unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].status, InstanceStatus::Active);
        }

        it "clears tokens without touching snapshots" {
            for n in 0..5 {
                db.insert_snapshot(&NewSnapshot::new("P", json!({ "n": n }))).unwrap();
            }
            db.upsert_instance(&input).unwrap();
            db.add_token_usage("I", 500).unwrap();
            let before = db.list_snapshots("P").unwrap();

            assert!(db.clear_tokens("I").unwrap());

            assert_eq!(db.get_instance("I").unwrap().unwrap().current_token_usage, 0);
            assert_eq!(db.list_snapshots("P").unwrap(), before);
        }
    }
}
