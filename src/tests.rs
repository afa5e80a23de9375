use crate::clock::{Clock, ManualClock};
use crate::commands::Tracker;
use crate::config::TrackerConfig;
use crate::database::Database;
use crate::engine::*;
use crate::error::TimerError;
use crate::sync::{Operation, SyncQueue};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

#[cfg(test)]
mod tests {
    use super::*;

    /// On-disk store plus a clock parked at 10:00 local time.
    fn fixture() -> (Arc<Database>, Arc<ManualClock>, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::new(&dir.path().join("timeledger.db")).unwrap());
        let clock = Arc::new(ManualClock::starting_now());
        clock.set_wall(local_day_start(clock.now_secs()) + 10 * 3600);
        (db, clock, dir)
    }

    /// A fresh engine over `db`, as after a process (re)start.
    fn boot(db: &Arc<Database>, clock: &Arc<ManualClock>) -> TimerEngine {
        let engine = TimerEngine::new(Some(db.clone()), clock.clone(), 300);
        engine.restore().unwrap();
        engine
    }

    fn fail_timer_writes(db: &Database) {
        db.conn
            .lock()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER fail_timer BEFORE UPDATE ON timer_state
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )
            .unwrap();
    }

    fn allow_timer_writes(db: &Database) {
        db.conn
            .lock()
            .unwrap()
            .execute_batch("DROP TRIGGER fail_timer;")
            .unwrap();
    }

    mod timer_engine_tests {
        use super::*;

        #[test]
        fn test_start_pause_resume_stop_scenario_survives_restart() {
            let (db, clock, _dir) = fixture();
            let engine = boot(&db, &clock);

            engine.start().unwrap();
            clock.advance(5);
            engine.pause().unwrap();
            engine.resume().unwrap();
            clock.advance(3);
            let stopped = engine.stop().unwrap();
            assert_eq!(stopped.state, TimerStatus::Stopped);
            assert_eq!(stopped.accumulated_seconds, 8);
            drop(engine);

            let restarted = boot(&db, &clock);
            let state = restarted.get_state();
            assert_eq!(state.state, TimerStatus::Stopped);
            assert_eq!(state.accumulated_seconds, 8);
            assert_eq!(state.session_start, None);
        }

        #[test]
        fn test_accumulated_is_sum_of_running_intervals() {
            let (db, clock, _dir) = fixture();
            let engine = boot(&db, &clock);
            let intervals = [5u64, 12, 1, 30, 7];

            for (i, secs) in intervals.iter().enumerate() {
                if i == 0 {
                    engine.start().unwrap();
                } else {
                    engine.resume().unwrap();
                }
                clock.advance(*secs);
                engine.pause().unwrap();
                // Paused time never counts
                clock.advance(100);
            }
            let stopped = engine.stop().unwrap();

            assert_eq!(stopped.accumulated_seconds, intervals.iter().sum::<u64>());
            let row = db.load_timer_state().unwrap().unwrap();
            assert_eq!(row.accumulated_seconds, 55);
            assert_eq!(row.state, "stopped");
        }

        #[test]
        fn test_reset_day_is_idempotent_across_midnight() {
            let (db, clock, _dir) = fixture();
            let today = local_day_start(clock.now_secs());
            let tomorrow = local_day_start(today + 36 * 3600);
            clock.set_wall(tomorrow - 10);
            let engine = boot(&db, &clock);

            engine.start().unwrap();
            clock.advance(20);
            let first = engine.reset_day().unwrap();
            assert_eq!(first.state, TimerStatus::Running);
            assert_eq!(first.day_start, tomorrow);
            assert_eq!(first.accumulated_seconds, 0);
            assert_eq!(first.today_seconds, 10);

            let second = engine.reset_day().unwrap();
            assert_eq!(second, first);
        }

        #[test]
        fn test_get_state_does_not_need_store() {
            let (db, clock, _dir) = fixture();
            let engine = boot(&db, &clock);
            engine.start().unwrap();
            clock.advance(4);
            fail_timer_writes(&db);

            let state = engine.get_state();
            assert_eq!(state.state, TimerStatus::Running);
            assert_eq!(state.elapsed_seconds, 4);
        }
    }

    mod crash_recovery_tests {
        use super::*;

        #[test]
        fn test_crash_after_write_reproduces_post_transition_state() {
            let (db, clock, _dir) = fixture();
            let engine = boot(&db, &clock);
            engine.start().unwrap();
            clock.advance(5);
            engine.pause().unwrap();
            drop(engine);

            let restarted = boot(&db, &clock);
            let state = restarted.get_state();
            assert_eq!(state.state, TimerStatus::Paused);
            assert_eq!(state.accumulated_seconds, 5);
            assert!(!state.restored_from_running);
        }

        #[test]
        fn test_crash_before_write_reproduces_pre_transition_state() {
            let (db, clock, _dir) = fixture();
            let engine = boot(&db, &clock);
            engine.start().unwrap();
            clock.advance(5);
            engine.save_state().unwrap();
            clock.advance(3);

            fail_timer_writes(&db);
            assert!(matches!(engine.pause(), Err(TimerError::Persistence(_))));
            assert_eq!(engine.get_state().state, TimerStatus::Running);
            drop(engine);
            allow_timer_writes(&db);

            // The store still says Running: the pause never happened
            let restarted = TimerEngine::new(Some(db.clone()), clock.clone(), 300);
            let report = restarted.restore().unwrap();
            assert!(report.was_running);
            assert_eq!(report.credited_seconds, 8);
            assert_eq!(report.snapshot.state, TimerStatus::Paused);
            assert!(report.snapshot.restored_from_running);
            assert_eq!(report.snapshot.accumulated_seconds, 8);
        }

        #[test]
        fn test_restore_never_yields_running() {
            let (db, clock, _dir) = fixture();
            let mut engine = boot(&db, &clock);
            engine.start().unwrap();

            for _ in 0..3 {
                clock.advance(10);
                engine.save_state().unwrap();
                drop(engine);

                engine = TimerEngine::new(Some(db.clone()), clock.clone(), 300);
                let report = engine.restore().unwrap();
                assert_eq!(report.snapshot.state, TimerStatus::Paused);
                assert!(report.snapshot.restored_from_running);
                engine.resume().unwrap();
            }
        }
    }

    mod bootstrap_tests {
        use super::*;

        #[test]
        fn test_corrupted_database_is_moved_aside() {
            let dir = TempDir::new().unwrap();
            std::fs::write(dir.path().join("timeledger.db"), vec![0x5a; 8192]).unwrap();

            let db = crate::open_database(dir.path()).unwrap();
            assert!(db.load_timer_state().unwrap().is_none());
            let backups = std::fs::read_dir(dir.path())
                .unwrap()
                .filter_map(|e| e.ok())
                .filter(|e| {
                    e.file_name()
                        .to_string_lossy()
                        .starts_with("timeledger.db.corrupted.")
                })
                .count();
            assert_eq!(backups, 1);
        }

        #[test]
        fn test_opened_runtime_leaves_live_session_alone() {
            let dir = TempDir::new().unwrap();
            let config = TrackerConfig {
                data_dir: dir.path().to_path_buf(),
                ..TrackerConfig::default()
            };

            let session = crate::Runtime::bootstrap(config.clone()).unwrap();
            session.tracker().start().unwrap();
            session.tracker().save_state().unwrap();

            // A second process inspects the store while the session runs
            let inspect = crate::Runtime::open(config.clone()).unwrap();
            assert!(inspect.restore_report().is_none());
            let row = inspect.tracker().persisted_state().unwrap().unwrap();
            assert_eq!(row.state, "running");
            assert_eq!(inspect.tracker().get_sync_status().unwrap().pending_count, 1);
            inspect.shutdown();

            assert_eq!(session.tracker().get_state().state, TimerStatus::Running);
            session.tracker().pause().unwrap();
            session.shutdown();

            let after = crate::Runtime::open(config).unwrap();
            let row = after.tracker().persisted_state().unwrap().unwrap();
            assert_eq!(row.state, "paused");
            assert!(!row.restored_from_running);
            let failed = after.tracker().get_failed_tasks(10).unwrap();
            assert!(failed.is_empty());
            assert_eq!(after.tracker().get_sync_status().unwrap().pending_count, 2);
            after.shutdown();
        }
    }

    mod sync_queue_tests {
        use super::*;

        #[test]
        fn test_same_operation_within_dedup_window_is_one_task() {
            let (db, clock, _dir) = fixture();
            let queue = SyncQueue::new(db.clone(), clock.clone(), &TrackerConfig::default());

            let first = queue.enqueue(Operation::Pause, &json!({"localId": "e1"})).unwrap();
            clock.advance(2);
            let second = queue.enqueue(Operation::Pause, &json!({"localId": "e1"})).unwrap();
            assert_eq!(first, second);
            assert_eq!(db.pending_count().unwrap(), 1);

            clock.advance(10);
            let third = queue.enqueue(Operation::Pause, &json!({"localId": "e1"})).unwrap();
            assert_ne!(third, first);
        }
    }

    mod tracker_sync_tests {
        use super::*;
        use wiremock::matchers::{body_json, header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        fn tracker(server: &MockServer) -> (Tracker, Arc<Database>, Arc<ManualClock>, TempDir) {
            let (db, clock, dir) = fixture();
            let mut config = TrackerConfig {
                data_dir: dir.path().to_path_buf(),
                ..TrackerConfig::default()
            };
            config.sync.api_base_url = server.uri();
            config.sync.http_timeout_secs = 5;
            let tracker = Tracker::new(db.clone(), clock.clone(), &config);
            tracker.restore().unwrap();
            (tracker, db, clock, dir)
        }

        #[tokio::test]
        async fn test_offline_session_is_delivered_in_order() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/time-entries"))
                .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "srv-42"})))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("PUT"))
                .and(path("/time-entries/srv-42/pause"))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("PUT"))
                .and(path("/time-entries/srv-42/stop"))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&server)
                .await;

            let (tracker, _db, clock, _dir) = tracker(&server);
            tracker.set_tokens(Some("tok".into()), None).await;

            tracker.start_with(json!({"projectId": "p1"})).unwrap();
            clock.advance(60);
            tracker.pause().unwrap();
            clock.advance(10);
            tracker.stop().unwrap();
            assert_eq!(tracker.get_sync_status().unwrap().pending_count, 3);

            assert_eq!(tracker.sync_now(10).await.unwrap(), 3);
            let status = tracker.get_sync_status().unwrap();
            assert_eq!(status.pending_count, 0);
            assert_eq!(status.failed_count, 0);
            assert!(status.is_online);
        }

        #[tokio::test]
        async fn test_unauthorized_pause_refreshes_once() {
            let server = MockServer::start().await;
            Mock::given(method("PUT"))
                .and(path("/time-entries/srv-7/pause"))
                .and(header("Authorization", "Bearer old"))
                .respond_with(ResponseTemplate::new(401))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/auth/refresh"))
                .and(body_json(json!({"refresh_token": "r1"})))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_json(json!({"access_token": "new", "refresh_token": "r2"})),
                )
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("PUT"))
                .and(path("/time-entries/srv-7/pause"))
                .and(header("Authorization", "Bearer new"))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&server)
                .await;

            let (tracker, _db, _clock, _dir) = tracker(&server);
            tracker.set_tokens(Some("old".into()), Some("r1".into())).await;
            tracker
                .enqueue(Operation::Pause, &json!({"id": "srv-7"}))
                .unwrap();

            assert_eq!(tracker.sync_now(10).await.unwrap(), 1);
            let status = tracker.get_sync_status().unwrap();
            assert!(!status.auth_degraded);
            assert!(!status.reauth_required);
        }

        #[tokio::test]
        async fn test_sync_failure_never_blocks_timer() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/time-entries"))
                .respond_with(ResponseTemplate::new(500))
                .mount(&server)
                .await;

            let (tracker, _db, clock, _dir) = tracker(&server);
            tracker.set_tokens(Some("tok".into()), None).await;

            tracker.start().unwrap();
            assert_eq!(tracker.sync_now(10).await.unwrap(), 0);
            clock.advance(30);
            let paused = tracker.pause().unwrap();
            assert_eq!(paused.accumulated_seconds, 30);

            let status = tracker.get_sync_status().unwrap();
            assert_eq!(status.pending_count, 2);
        }
    }
}
