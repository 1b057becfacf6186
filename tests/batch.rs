//! Batch, concurrency and cancellation integration tests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeExecutor, Harness};
use medpipe::core::{ProcessRequest, StatusReport};
use medpipe::domain::{ErrorKind, RunOutcome, Step, StepStatus, TaskStatus};
use tokio::sync::Notify;

#[tokio::test]
async fn test_batch_discovers_every_patient() {
    let h = Harness::new();
    h.add_dicom("P002");
    h.add_dicom("P001");
    std::fs::write(h.root().join("0_DICOM").join("notes.txt"), b"ignored").unwrap();
    std::fs::create_dir_all(h.root().join("0_DICOM").join(".cache")).unwrap();

    let batch = h.orchestrator.process(&h.root(), None, None).await.unwrap();

    let patients: Vec<&str> = batch.runs.keys().map(String::as_str).collect();
    assert_eq!(patients, vec!["P001", "P002"]);
    assert!(batch.is_all_succeeded());
    assert_eq!(h.fake(Step::DicomToNii).calls(), 2);

    let task = h.orchestrator.registry().get_task(&batch.task_uid).unwrap().unwrap();
    assert_eq!(task.total_steps, 12);
    assert_eq!(task.last_completed_step, 12);
    assert_eq!(task.status, TaskStatus::Succeeded);
}

#[tokio::test]
async fn test_patient_failure_is_isolated() {
    let h = Harness::build(|step| {
        Some(match step {
            Step::Registration => FakeExecutor::new().failing_for("P1"),
            _ => FakeExecutor::new(),
        })
    });
    h.add_dicom("P1");
    h.add_dicom("P2");

    let batch = h.orchestrator.process(&h.root(), None, None).await.unwrap();

    let p1 = batch.get("P1").unwrap();
    assert_eq!(p1.outcome, RunOutcome::Failed);
    assert_eq!(p1.results.len(), 2);
    assert_eq!(p1.failed_result().unwrap().step, Step::Registration);

    let p2 = batch.get("P2").unwrap();
    assert_eq!(p2.outcome, RunOutcome::Succeeded);
    assert_eq!(p2.results.len(), 6);
    assert!(p2.results.iter().all(|r| r.status == StepStatus::Succeeded));

    assert_eq!(batch.failed(), vec!["P1"]);
    assert_eq!(batch.succeeded(), vec!["P2"]);

    let task = h.orchestrator.registry().get_task(&batch.task_uid).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.last_completed_step, 7);
    assert_eq!(task.failed_step_uid.as_deref(), Some("P1:registration"));
}

#[tokio::test]
async fn test_stop_on_patient_failure_halts_other_patients() {
    // One worker: P1 runs to its failure before P2 is started
    let h = Harness::build_with_workers(1, |step| {
        Some(match step {
            Step::DicomToNii => FakeExecutor::new().failing_for("P1"),
            _ => FakeExecutor::new(),
        })
    });
    h.add_dicom("P1");
    h.add_dicom("P2");

    let request = ProcessRequest::new(h.root()).stop_on_patient_failure(true);
    let batch = h.orchestrator.process_request(request).await.unwrap();

    assert_eq!(batch.get("P1").unwrap().outcome, RunOutcome::Failed);
    let p2 = batch.get("P2").unwrap();
    assert_eq!(p2.outcome, RunOutcome::Cancelled);
    assert!(p2.results.is_empty());
    assert_eq!(h.fake(Step::DicomToNii).calls(), 1);

    let task = h.orchestrator.registry().get_task(&batch.task_uid).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.last_completed_step, 0);
}

#[tokio::test]
async fn test_without_stop_on_failure_other_patients_continue() {
    let h = Harness::build_with_workers(1, |step| {
        Some(match step {
            Step::DicomToNii => FakeExecutor::new().failing_for("P1"),
            _ => FakeExecutor::new(),
        })
    });
    h.add_dicom("P1");
    h.add_dicom("P2");

    let batch = h.orchestrator.process(&h.root(), None, None).await.unwrap();

    assert_eq!(batch.get("P1").unwrap().outcome, RunOutcome::Failed);
    assert_eq!(batch.get("P2").unwrap().outcome, RunOutcome::Succeeded);
}

#[tokio::test]
async fn test_concurrent_requests_for_same_patient_run_once() {
    let h = Harness::build(|_| Some(FakeExecutor::new().with_delay(Duration::from_millis(50))));
    h.add_dicom("P001");
    let root = h.root();

    let (a, b) = tokio::join!(
        h.orchestrator.process_single_step(&root, "P001", Step::DicomToNii, false),
        h.orchestrator.process_single_step(&root, "P001", Step::DicomToNii, false),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(h.fake(Step::DicomToNii).calls(), 1);
    assert_eq!(h.fake(Step::DicomToNii).max_concurrency(), 1);
    assert!(a.is_succeeded() && b.is_succeeded());
    assert!(a.skipped != b.skipped, "exactly one request should reuse the output");
}

#[tokio::test]
async fn test_workers_bound_parallel_patients() {
    let h = Harness::build(|_| Some(FakeExecutor::new().with_delay(Duration::from_millis(20))));
    for i in 0..6 {
        h.add_dicom(&format!("P{:03}", i));
    }

    let batch = h
        .orchestrator
        .process(&h.root(), None, Some(vec![Step::DicomToNii]))
        .await
        .unwrap();

    assert_eq!(batch.runs.len(), 6);
    assert!(batch.is_all_succeeded());
    assert!(h.fake(Step::DicomToNii).max_concurrency() <= 4);
}

#[tokio::test]
async fn test_cancel_stops_at_step_boundary() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let (s, r) = (started.clone(), release.clone());

    let h = Harness::build(move |step| {
        Some(match step {
            Step::DicomToNii => FakeExecutor::new().gated(s.clone(), r.clone()),
            _ => FakeExecutor::new(),
        })
    });
    h.add_dicom("P001");

    let (task_uid, handle) = h
        .orchestrator
        .spawn(ProcessRequest::new(h.root()).patient("P001"))
        .unwrap();

    started.notified().await;
    assert!(h.orchestrator.cancel(&task_uid));
    release.notify_one();

    let batch = handle.await.unwrap().unwrap();
    let run = batch.get("P001").unwrap();

    // The in-flight step finishes; nothing after it starts
    assert_eq!(run.outcome, RunOutcome::Cancelled);
    assert_eq!(run.results.len(), 1);
    assert!(run.results[0].is_succeeded());
    assert_eq!(h.fake(Step::Registration).calls(), 0);
    assert_eq!(batch.cancelled(), vec!["P001"]);

    let task = h.orchestrator.registry().get_task(&task_uid).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.last_completed_step, 1);

    let record = h.orchestrator.progress().get_progress(&task_uid).unwrap();
    assert!(record.completed);
    assert_eq!(record.status, TaskStatus::Cancelled);

    // Finished tasks are no longer cancellable
    assert!(!h.orchestrator.cancel(&task_uid));
}

#[tokio::test]
async fn test_discarded_run_leaves_no_queued_task() {
    let h = Harness::new();
    h.add_dicom("P001");

    let prepared = h.orchestrator.prepare(ProcessRequest::new(h.root()).patient("P001")).unwrap();
    let task_uid = prepared.task_uid.clone();
    assert_eq!(h.orchestrator.active_tasks(), 1);

    h.orchestrator.discard(prepared).unwrap();

    assert_eq!(h.orchestrator.active_tasks(), 0);
    assert!(!h.orchestrator.cancel(&task_uid));
    assert_eq!(h.total_calls(), 0);

    let task = h.orchestrator.registry().get_task(&task_uid).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    let record = h.orchestrator.progress().get_progress(&task_uid).unwrap();
    assert!(record.completed);
}

#[tokio::test]
async fn test_status_report_for_all_patients() {
    let h = Harness::new();
    h.add_dicom("P001");
    h.add_dicom("P002");

    h.orchestrator
        .process(&h.root(), Some("P001"), Some(vec![Step::DicomToNii, Step::Registration]))
        .await
        .unwrap();

    match h.orchestrator.get_status(&h.root(), None).unwrap() {
        StatusReport::All(all) => {
            assert_eq!(all.len(), 2);
            assert_eq!(all["P001"].last_completed_step, Some(Step::Registration));
            assert_eq!(all["P001"].next_step, Some(Step::NnunetSegmentation));
            assert_eq!(all["P002"].last_completed_step, None);
            assert!(all["P002"].raw_input_present);
        }
        other => panic!("expected all-patient report, got {:?}", other),
    }

    match h.orchestrator.get_status(&h.root(), Some("P002")).unwrap() {
        StatusReport::Patient(status) => assert_eq!(status.next_step, Some(Step::DicomToNii)),
        other => panic!("expected single-patient report, got {:?}", other),
    }

    let tree = h.orchestrator.get_data_structure(&h.root()).unwrap();
    assert_eq!(tree.stages.len(), 6);
    assert_eq!(tree.stages[3].dir_name, "3_N4");
    assert_eq!(tree.stages[0].patients, vec!["P001", "P002"]);
    assert_eq!(tree.stages[2].patients, vec!["P001"]);
    assert!(!tree.stages[3].exists);
}

#[tokio::test]
async fn test_precondition_failure_in_batch_keeps_others_running() {
    let h = Harness::new();
    h.add_dicom("P001");
    h.add_dicom("P002");

    let batch = h
        .orchestrator
        .process(&h.root(), None, Some(vec![Step::Registration]))
        .await
        .unwrap();

    for run in batch.runs.values() {
        assert_eq!(run.results[0].error_kind, Some(ErrorKind::PreconditionError));
    }
    assert_eq!(h.fake(Step::Registration).calls(), 0);
}
