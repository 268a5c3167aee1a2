//! Six end-to-end pipeline scenarios run in-process against
//! `sf_e2e_harness::Pipeline` without any live server: the happy path,
//! the audit-fail branch, duplicate notifications, a transient publish
//! failure, a permanent stage failure, and redaction determinism.

use sf_domain::{AuditArtifact, InputRef, ModelCallError, RunId, RunOutcome, RunStatus, Stage};
use sf_e2e_harness::{Pipeline, PipelineScript};
use sf_ports::{ArtifactStore, StateStore};

fn run_id_for(bucket: &str, name: &str, generation: &str) -> RunId {
    RunId::from_input(&InputRef::new(bucket, name, generation, None))
}

fn compliant_audit() -> AuditArtifact {
    AuditArtifact {
        hipaa_compliant: true,
        fail_identifiers: Vec::new(),
        comments: String::new(),
        hipaa_pass: true,
    }
}

fn non_compliant_audit() -> AuditArtifact {
    AuditArtifact {
        hipaa_compliant: false,
        fail_identifiers: vec![sf_domain::FailIdentifier {
            identifier_type: "name".to_string(),
            text: "exposed".to_string(),
            position: "segment 1".to_string(),
        }],
        comments: "unmasked identifier found".to_string(),
        hipaa_pass: false,
    }
}

#[tokio::test]
async fn happy_path_completes_with_pass_outcome() {
    let pipeline = Pipeline::new(PipelineScript {
        transcript_text: Some("patient states no issues today".to_string()),
        audit_script: vec![Ok(compliant_audit())],
        soap_script: Vec::new(),
        ..Default::default()
    });

    let (outcome, run) = pipeline.submit_notification("bkt", "visit-1.wav", "1", "corr-1").await.unwrap();
    assert!(matches!(outcome, sf_e2e_harness::ingestion_sim::PushOutcome::Dispatched { created: true }));
    assert!(run.is_some());

    pipeline.drive().await;

    let run_id = run_id_for("bkt", "visit-1.wav", "1");
    let run = pipeline.state.get_run(&run_id).await.unwrap().expect("run recorded");
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.outcome, Some(RunOutcome::Pass));

    let soap_bytes = pipeline.artifacts.get(&run_id, Stage::Soap).await.expect("soap artifact written");
    let soap: sf_domain::SoapArtifact = serde_json::from_slice(&soap_bytes).unwrap();
    assert!(soap.soap_note.contains("Subjective"));
}

#[tokio::test]
async fn audit_rejection_finalizes_the_run_without_a_soap_note() {
    let pipeline = Pipeline::new(PipelineScript {
        audit_script: vec![Ok(non_compliant_audit())],
        ..Default::default()
    });

    pipeline.submit_notification("bkt", "visit-2.wav", "1", "corr-2").await.unwrap();
    pipeline.drive().await;

    let run_id = run_id_for("bkt", "visit-2.wav", "1");
    let run = pipeline.state.get_run(&run_id).await.unwrap().expect("run recorded");
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.outcome, Some(RunOutcome::Fail));

    let soap_result = pipeline.artifacts.get(&run_id, Stage::Soap).await;
    assert!(soap_result.is_err(), "soap stage must never run after an audit rejection");
}

#[tokio::test]
async fn duplicate_notifications_dispatch_the_run_exactly_once() {
    let pipeline = Pipeline::new(PipelineScript {
        audit_script: vec![Ok(compliant_audit())],
        ..Default::default()
    });

    let mut created_count = 0;
    let mut duplicate_count = 0;
    for _ in 0..5 {
        let (outcome, _) = pipeline.submit_notification("bkt", "visit-3.wav", "1", "corr-3").await.unwrap();
        match outcome {
            sf_e2e_harness::ingestion_sim::PushOutcome::Dispatched { created: true } => created_count += 1,
            sf_e2e_harness::ingestion_sim::PushOutcome::Duplicate => duplicate_count += 1,
            other => panic!("unexpected outcome for a redelivered notification: {other:?}"),
        }
    }
    pipeline.drive().await;

    assert_eq!(created_count, 1);
    assert_eq!(duplicate_count, 4);

    let run_id = run_id_for("bkt", "visit-3.wav", "1");
    let run = pipeline.state.get_run(&run_id).await.unwrap().expect("run recorded");
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.outcome, Some(RunOutcome::Pass));
}

#[tokio::test]
async fn transient_publish_failures_recover_through_the_worker_retry_loop() {
    let pipeline = Pipeline::new(PipelineScript {
        audit_script: vec![Ok(compliant_audit())],
        ..Default::default()
    });

    pipeline.bus.fail_next_publishes(2);
    pipeline.submit_notification("bkt", "visit-4.wav", "1", "corr-4").await.unwrap();
    pipeline.drive().await;

    let run_id = run_id_for("bkt", "visit-4.wav", "1");
    let run = pipeline.state.get_run(&run_id).await.unwrap().expect("run recorded");
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.outcome, Some(RunOutcome::Pass));
}

#[tokio::test]
async fn permanent_transcription_failure_fails_the_run() {
    let pipeline = Pipeline::new(PipelineScript {
        transcribe_script: vec![Err(ModelCallError::InvalidResponse("upstream returned garbage".to_string()))],
        ..Default::default()
    });

    pipeline.submit_notification("bkt", "visit-5.wav", "1", "corr-5").await.unwrap();
    pipeline.drive().await;

    let run_id = run_id_for("bkt", "visit-5.wav", "1");
    let run = pipeline.state.get_run(&run_id).await.unwrap().expect("run recorded");
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.outcome, None);

    let redacted = pipeline.artifacts.get(&run_id, Stage::Redact).await;
    assert!(redacted.is_err(), "redact must never run once transcription permanently fails");
}

#[tokio::test]
async fn redaction_is_deterministic_across_independent_runs_with_the_same_salt() {
    let transcript = "patient [[PHI:NAME:Jordan Lee]] reports improvement".to_string();

    let pipeline_a = Pipeline::new(PipelineScript {
        transcript_text: Some(transcript.clone()),
        audit_script: vec![Ok(compliant_audit())],
        redaction_salt: "shared-salt".to_string(),
        ..Default::default()
    });
    let pipeline_b = Pipeline::new(PipelineScript {
        transcript_text: Some(transcript),
        audit_script: vec![Ok(compliant_audit())],
        redaction_salt: "shared-salt".to_string(),
        ..Default::default()
    });

    pipeline_a.submit_notification("bkt", "visit-6a.wav", "1", "corr-6a").await.unwrap();
    pipeline_b.submit_notification("bkt", "visit-6b.wav", "1", "corr-6b").await.unwrap();
    pipeline_a.drive().await;
    pipeline_b.drive().await;

    let run_id_a = run_id_for("bkt", "visit-6a.wav", "1");
    let run_id_b = run_id_for("bkt", "visit-6b.wav", "1");

    let redacted_a: sf_domain::RedactedArtifact =
        serde_json::from_slice(&pipeline_a.artifacts.get(&run_id_a, Stage::Redact).await.unwrap()).unwrap();
    let redacted_b: sf_domain::RedactedArtifact =
        serde_json::from_slice(&pipeline_b.artifacts.get(&run_id_b, Stage::Redact).await.unwrap()).unwrap();

    assert_eq!(redacted_a.text, redacted_b.text);
    assert!(!redacted_a.text.contains("Jordan Lee"));
}
