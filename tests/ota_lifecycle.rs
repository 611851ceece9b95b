// End-to-end OTA lifecycle against the simulated device

use cloud_ota::ota::{
    ApplyContext, ApplyOutcome, Diagnostics, FetchOutcome, Job, OtaCallbacks, OtaEngine, OtaError,
    OtaHandler, ValidationState,
};
use cloud_ota::platform::sim::SimDevice;
use cloud_ota::platform::SlotState;
use cloud_ota::system::JobIdStore;
use cloud_ota::OtaConfig;
use proptest::prelude::*;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const JOB_123: &str = r#"{"ota_job_id":"123","url":"https://x/y.bin","file_size":1000}"#;

fn config() -> OtaConfig {
    OtaConfig {
        autofetch_period_hours: 0,
        rollback_timeout_secs: 30,
        confirm_retry_interval_ms: 5,
        restart_after_apply: false,
        ..OtaConfig::default()
    }
}

fn engine(device: &SimDevice, callbacks: OtaCallbacks) -> OtaEngine {
    let engine = OtaEngine::new(device.platform());
    engine.enable(config(), callbacks).unwrap();
    engine
}

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

fn job_ids(device: &SimDevice) -> JobIdStore {
    JobIdStore::new(device.store.clone())
}

#[test]
fn no_update_sentinel_is_an_empty_success() {
    let device = SimDevice::new(SlotState::Valid);
    let engine = engine(&device, OtaCallbacks::default());
    device
        .transport
        .push_get(200, r#"{"error_code":105065,"description":"no update"}"#);

    assert_eq!(engine.fetch().unwrap(), FetchOutcome::NoUpdate);
    assert!(!engine.is_in_progress());
    assert!(device.transport.posts().is_empty());
}

#[test]
fn other_cloud_error_is_surfaced() {
    let device = SimDevice::new(SlotState::Valid);
    let engine = engine(&device, OtaCallbacks::default());
    device
        .transport
        .push_get(400, r#"{"error_code":105001,"description":"node not registered"}"#);

    match engine.fetch() {
        Err(OtaError::Cloud { code, description }) => {
            assert_eq!(code, 105001);
            assert_eq!(description, "node not registered");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(!engine.is_in_progress());
}

#[test]
fn job_reaches_handler_while_in_progress() {
    let device = SimDevice::new(SlotState::Valid);
    let (seen_tx, seen_rx) = mpsc::channel::<Job>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let seen_tx = Mutex::new(seen_tx);
    let release_rx = Mutex::new(release_rx);

    let handler = move |job: &Job, _: &ApplyContext| {
        let _ = seen_tx.lock().unwrap().send(job.clone());
        let _ = release_rx.lock().unwrap().recv();
        ApplyOutcome::Deferred("Waiting for the user".into())
    };
    let engine = engine(
        &device,
        OtaCallbacks {
            handler: Some(Arc::new(handler) as Arc<dyn OtaHandler>),
            diagnostics: None,
        },
    );
    device.transport.push_get(200, JOB_123);

    let fetcher = {
        let engine = engine.clone();
        thread::spawn(move || engine.fetch())
    };

    let job = seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(
        job,
        Job {
            job_id: "123".into(),
            url: "https://x/y.bin".into(),
            file_size: 1000,
            fw_version: None,
            metadata: None,
        }
    );
    assert!(engine.is_in_progress());
    assert_eq!(engine.status().job_id.as_deref(), Some("123"));

    // A second fetch meanwhile does no I/O at all
    let gets_before = device.transport.get_paths().len();
    assert!(matches!(engine.fetch(), Err(OtaError::InvalidState(_))));
    assert_eq!(device.transport.get_paths().len(), gets_before);
    assert_eq!(engine.status().job_id.as_deref(), Some("123"));

    release_tx.send(()).unwrap();
    let outcome = fetcher.join().unwrap().unwrap();
    assert_eq!(outcome, FetchOutcome::Deferred("Waiting for the user".into()));
    assert!(!engine.is_in_progress());
    assert_eq!(engine.status().job_id, None);
    assert_eq!(device.transport.reports_with_status("delayed").len(), 1);
}

#[test]
fn applied_job_id_is_persisted_before_reboot() {
    let device = SimDevice::new(SlotState::Valid);
    let engine = engine(&device, OtaCallbacks::default());
    device.transport.push_get(200, JOB_123);
    device.transport.serve_image("https://x/y.bin", image(1000));

    assert_eq!(engine.fetch().unwrap(), FetchOutcome::Applied("123".into()));
    assert_eq!(job_ids(&device).load().unwrap().as_deref(), Some("123"));
    assert_eq!(device.partitions.staged_image(), Some(image(1000)));
    assert!(!engine.is_in_progress());
}

#[test]
fn wrongly_typed_payload_is_rejected_against_its_id() {
    let device = SimDevice::new(SlotState::Valid);
    let engine = engine(&device, OtaCallbacks::default());
    device
        .transport
        .push_get(200, r#"{"ota_job_id":"7","url":"https://x/y.bin","file_size":"big"}"#);

    assert!(matches!(engine.fetch(), Err(OtaError::Parse(_))));
    let rejected = device.transport.reports_with_status("rejected");
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0]["ota_job_id"], "7");
    assert!(device.transport.reports_with_status("accepted").is_empty());
    assert!(!engine.is_in_progress());
    assert_eq!(job_ids(&device).load().unwrap(), None);

    device
        .transport
        .push_get(200, r#"{"error_code":105065,"description":"no update"}"#);
    assert_eq!(engine.fetch().unwrap(), FetchOutcome::NoUpdate);
}

#[test]
fn unpersisted_job_id_never_restarts() {
    let device = SimDevice::new(SlotState::Valid);
    let engine = OtaEngine::new(device.platform());
    engine
        .enable(
            OtaConfig {
                restart_after_apply: true,
                ..config()
            },
            OtaCallbacks::default(),
        )
        .unwrap();
    device.transport.push_get(200, JOB_123);
    device.transport.serve_image("https://x/y.bin", image(1000));
    device.store.fail_writes(true);

    assert!(matches!(engine.fetch().unwrap(), FetchOutcome::Rejected(_)));
    assert_eq!(device.partitions.stats().restart_calls, 0);
    let rejected = device.transport.reports_with_status("rejected");
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0]["ota_job_id"], "123");
    assert!(!engine.is_in_progress());
}

#[test]
fn failed_download_is_rejected_and_engine_recovers() {
    let device = SimDevice::new(SlotState::Valid);
    let engine = engine(&device, OtaCallbacks::default());
    device.transport.push_get(200, JOB_123);

    assert!(matches!(engine.fetch().unwrap(), FetchOutcome::Rejected(_)));
    let rejected = device.transport.reports_with_status("rejected");
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0]["ota_job_id"], "123");
    assert_eq!(job_ids(&device).load().unwrap(), None);

    device
        .transport
        .push_get(200, r#"{"error_code":105065,"description":"no update"}"#);
    assert_eq!(engine.fetch().unwrap(), FetchOutcome::NoUpdate);
}

#[test]
fn mark_valid_twice_matches_once() {
    let device = SimDevice::new(SlotState::PendingVerify);
    job_ids(&device).save("77").unwrap();
    // Keep the confirmation loop busy so only mark_valid acts
    for _ in 0..1000 {
        device.transport.push_post(503);
    }
    let engine = engine(&device, OtaCallbacks::default());
    assert!(engine.rollback_armed());

    engine.mark_valid().unwrap();
    assert_eq!(device.partitions.state(), SlotState::Valid);
    assert!(!engine.rollback_armed());

    engine.mark_valid().unwrap();
    assert_eq!(device.partitions.state(), SlotState::Valid);
    assert!(!engine.rollback_armed());
    assert!(engine.status().valid);
    assert_eq!(engine.status().validation, ValidationState::Valid);
}

#[test]
fn failed_diagnostics_roll_back_without_success_report() {
    let device = SimDevice::new(SlotState::PendingVerify);
    job_ids(&device).save("88").unwrap();
    let diagnostics: Arc<dyn Diagnostics> =
        Arc::new(|| -> anyhow::Result<()> { anyhow::bail!("display not responding") });

    let engine = engine(
        &device,
        OtaCallbacks {
            handler: None,
            diagnostics: Some(diagnostics),
        },
    );

    assert_eq!(engine.status().validation, ValidationState::Invalid);
    assert!(!engine.rollback_armed());
    assert_eq!(device.partitions.state(), SlotState::Invalid);
    assert_eq!(device.partitions.stats().rollback_calls, 1);
    assert!(device.transport.reports_with_status("success").is_empty());

    // Back on the old image, the rollback is reported once
    device.partitions.simulate_reboot();
    let after = engine_after_reboot(&device);
    assert_eq!(after.status().validation, ValidationState::Valid);
    let rejected = device.transport.reports_with_status("rejected");
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0]["ota_job_id"], "88");
    assert_eq!(job_ids(&device).load().unwrap(), None);
}

fn engine_after_reboot(device: &SimDevice) -> OtaEngine {
    engine(device, OtaCallbacks::default())
}

#[test]
fn confirmation_retries_then_validates() {
    const FAILURES: usize = 4;
    let device = SimDevice::new(SlotState::Valid);
    let first = engine(&device, OtaCallbacks::default());
    device.transport.push_get(200, JOB_123);
    device.transport.serve_image("https://x/y.bin", image(1000));
    assert_eq!(first.fetch().unwrap(), FetchOutcome::Applied("123".into()));
    drop(first);

    device.partitions.simulate_reboot();
    assert_eq!(device.partitions.state(), SlotState::PendingVerify);
    let posts_before = device.transport.posts().len();
    for _ in 0..FAILURES {
        device.transport.push_post_error("network unreachable");
    }

    let engine = engine_after_reboot(&device);
    assert_eq!(engine.wait_for_confirmation(), ValidationState::Valid);

    let posts = device.transport.posts();
    assert_eq!(posts.len() - posts_before, FAILURES + 1);
    let last = posts[posts.len() - 1].json();
    assert_eq!(last["ota_job_id"], "123");
    assert_eq!(last["status"], "success");

    assert_eq!(device.partitions.state(), SlotState::Valid);
    assert_eq!(device.partitions.stats().mark_valid_calls, 1);
    assert_eq!(device.store.erase_count("ota_job", "job_id"), 1);
    assert_eq!(job_ids(&device).load().unwrap(), None);
    assert!(!engine.rollback_armed());
}

#[test]
fn disable_keeps_pending_confirmation() {
    let device = SimDevice::new(SlotState::PendingVerify);
    job_ids(&device).save("5").unwrap();
    device.transport.push_post_error("offline");

    let engine = engine(&device, OtaCallbacks::default());
    engine.disable().unwrap();
    assert_eq!(engine.wait_for_confirmation(), ValidationState::Valid);

    // The failed attempt is recorded too
    let success = device.transport.reports_with_status("success");
    assert_eq!(success.len(), 2);
    assert_eq!(success[1]["ota_job_id"], "5");
    assert_eq!(device.store.erase_count("ota_job", "job_id"), 1);
    assert_eq!(job_ids(&device).load().unwrap(), None);
}

fn missing_field_payload() -> impl Strategy<Value = String> {
    let id = prop_oneof![
        Just(None),
        Just(Some(String::new())),
        "[a-z0-9]{1,12}".prop_map(Some)
    ];
    let url = prop_oneof![
        Just(None),
        Just(Some(String::new())),
        "https://[a-z]{1,8}/[a-z]{1,8}\\.bin".prop_map(Some)
    ];
    (id, url, 1u64..10_000_000)
        .prop_filter("job_id or url must be missing", |(id, url, _)| {
            id.as_deref().map_or(true, str::is_empty) || url.as_deref().map_or(true, str::is_empty)
        })
        .prop_map(|(id, url, size)| {
            let mut obj = serde_json::Map::new();
            if let Some(id) = id {
                obj.insert("ota_job_id".into(), id.into());
            }
            if let Some(url) = url {
                obj.insert("url".into(), url.into());
            }
            obj.insert("file_size".into(), size.into());
            serde_json::Value::Object(obj).to_string()
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn payload_missing_id_or_url_is_rejected_once(payload in missing_field_payload()) {
        let device = SimDevice::new(SlotState::Valid);
        let engine = engine(&device, OtaCallbacks::default());
        device.transport.push_get(200, &payload);

        let res = engine.fetch();
        prop_assert!(matches!(res, Err(OtaError::InvalidJob(_))));
        prop_assert_eq!(device.transport.reports_with_status("rejected").len(), 1);
        prop_assert_eq!(device.transport.posts().len(), 1);
        prop_assert!(!engine.is_in_progress());
        prop_assert_eq!(job_ids(&device).load().unwrap(), None);
    }
}
