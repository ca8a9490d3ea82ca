//! Worker-pool dispatch: ordering, bounded concurrency, quota under contention.

mod common;

use std::time::Duration;

use common::harness::pdf_page_widths;
use common::{ScriptedEngine, TestHarness};
use scanbind::db::checkpoint_repo;
use scanbind::folders;
use scanbind::job::ItemStatus;
use scanbind::{JobEventType, JobStatus, KeySelectionStrategy};

#[test]
fn test_parallel_pages_are_assembled_in_order() {
    let h = TestHarness::new(ScriptedEngine::new().with_delay(Duration::from_millis(25)));
    h.add_credential("a", 100);
    let folder = h.make_folder("parallel", 7);

    let job_id = h.create_job(&[folder], KeySelectionStrategy::MaxRemaining, 3);
    let view = h.run(&job_id);

    assert_eq!(view.job.status, JobStatus::Completed);
    assert_eq!(view.items[0].image_done, 7);
    assert_eq!(h.engine.call_count(), 7);
    assert!(h.engine.max_in_flight() <= 3, "{}", h.engine.max_in_flight());

    let pdf = view.items[0].pdf_path.clone().unwrap();
    assert_eq!(pdf_page_widths(&pdf), vec![40, 41, 42, 43, 44, 45, 46]);
    assert_eq!(h.summary("a.json").used_units, 7);
}

#[test]
fn test_parallel_run_checkpoints_every_page_once() {
    let h = TestHarness::new(ScriptedEngine::new().with_delay(Duration::from_millis(10)));
    h.add_credential("a", 100);
    let folder = h.make_folder("kept", 7);
    // a file where the PDF directory should be: every page is OCRed and
    // checkpointed, then writing the PDF fails and the checkpoints stay
    std::fs::remove_dir_all(&h.output.pdf_directory).unwrap();
    std::fs::write(&h.output.pdf_directory, b"not a directory").unwrap();

    let job_id = h.create_job(&[folder.clone()], KeySelectionStrategy::MaxRemaining, 3);
    let view = h.run(&job_id);

    assert_eq!(view.job.status, JobStatus::Failed);
    assert_eq!(view.items[0].status, ItemStatus::Failed);
    assert_eq!(h.engine.call_count(), 7);

    let rows = checkpoint_repo::find_by_item(&h.db, &view.items[0].id).unwrap();
    let indices: Vec<usize> = rows.iter().map(|r| r.page_index).collect();
    assert_eq!(indices, (0..7).collect::<Vec<_>>());
    let stored: Vec<_> = rows.into_iter().map(|r| r.page.image_path).collect();
    assert_eq!(stored, folders::list_images(&folder).unwrap());
}

#[test]
fn test_parallel_stop_keeps_landed_pages_for_resume() {
    let h = TestHarness::new(ScriptedEngine::new().with_delay(Duration::from_millis(30)));
    h.add_credential("a", 100);
    let folder = h.make_folder("interrupted", 12);
    let job_id = h.create_job(&[folder], KeySelectionStrategy::MaxRemaining, 3);

    let mut events = h.events.subscribe();
    h.orchestrator.start(&job_id).unwrap();
    loop {
        let event = events.blocking_recv().unwrap();
        if event.event_type == JobEventType::ItemProgress {
            break;
        }
    }
    h.orchestrator.stop(&job_id).unwrap();
    h.orchestrator.wait(&job_id);
    assert!(h.wait_until(Duration::from_secs(5), || h
        .orchestrator
        .running_job()
        .is_none()));

    let stopped = h.orchestrator.get(&job_id).unwrap();
    assert_eq!(stopped.job.status, JobStatus::Stopped);
    assert_eq!(stopped.items[0].status, ItemStatus::Stopped);
    let first_calls = h.engine.call_count();
    assert!(first_calls < 12, "{} calls before the stop", first_calls);

    let item_id = stopped.items[0].id.clone();
    let rows = checkpoint_repo::find_by_item(&h.db, &item_id).unwrap();
    assert!(!rows.is_empty());
    assert_eq!(rows.len(), stopped.items[0].image_done);
    // pages land out of order; only the leading run is reusable
    let prefix = rows
        .iter()
        .enumerate()
        .take_while(|(i, r)| r.page_index == *i)
        .count();

    let resumed = h.run(&job_id);
    assert_eq!(resumed.job.status, JobStatus::Completed);
    assert_eq!(h.report_json(&job_id)["items"][0]["resumedFrom"], prefix);
    assert_eq!(h.engine.call_count() - first_calls, 12 - prefix);
    let pdf = resumed.items[0].pdf_path.clone().unwrap();
    assert_eq!(pdf_page_widths(&pdf), (40..52).collect::<Vec<i64>>());
}

#[test]
fn test_parallel_workers_never_overdraw_a_cap() {
    let h = TestHarness::new(ScriptedEngine::new().with_delay(Duration::from_millis(10)));
    h.add_credential("a", 2);
    h.add_credential("b", 3);
    h.add_credential("c", 4);
    let folder = h.make_folder("contended", 9);

    let job_id = h.create_job(&[folder], KeySelectionStrategy::RoundRobin, 4);
    let view = h.run(&job_id);

    assert_eq!(view.job.status, JobStatus::Completed);
    assert_eq!(h.summary("a.json").used_units, 2);
    assert_eq!(h.summary("b.json").used_units, 3);
    assert_eq!(h.summary("c.json").used_units, 4);
}

#[test]
fn test_parallel_run_runs_out_of_quota() {
    let h = TestHarness::new(ScriptedEngine::new());
    h.add_credential("a", 3);
    let folder = h.make_folder("too-many", 6);

    let job_id = h.create_job(&[folder], KeySelectionStrategy::MaxRemaining, 3);
    let view = h.run(&job_id);

    assert_eq!(view.job.status, JobStatus::Failed);
    assert_eq!(
        view.job.last_error.as_deref(),
        Some("All credentials are exhausted.")
    );
    assert_eq!(view.items[0].status, ItemStatus::Failed);
    assert!(view.items[0].pdf_path.is_none());
    assert_eq!(h.engine.call_count(), 3);
    assert_eq!(h.summary("a.json").used_units, 3);
}

#[test]
fn test_parallel_failure_keeps_finished_checkpoints() {
    let h = TestHarness::new(
        ScriptedEngine::new()
            .with_failing_image("page_5.png")
            .with_delay(Duration::from_millis(5)),
    );
    h.add_credential("a", 100);
    let folder = h.make_folder("partial", 5);

    let job_id = h.create_job(&[folder.clone()], KeySelectionStrategy::MaxRemaining, 2);
    let view = h.run(&job_id);
    assert_eq!(view.job.status, JobStatus::Failed);
    let failed_calls = h.engine.call_count();

    // drop the bad page; the retry only needs whatever was not checkpointed
    std::fs::remove_file(folder.join("page_5.png")).unwrap();
    let view = h.run(&job_id);
    assert_eq!(view.job.status, JobStatus::Completed);
    let pdf = view.items[0].pdf_path.clone().unwrap();
    assert_eq!(pdf_page_widths(&pdf), vec![40, 41, 42, 43]);
    assert!(h.engine.call_count() - failed_calls <= 4);
}
