//! Driver behavior against a recording stub firmware

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{wait_for, Failure, RecordingAggregator, StubFirmware};
use tokio::sync::oneshot;
use vpc_core::{
    DeviceHandle, ErrorKind, Feature, GateOptions, Generic, Ideapad, Outcome, PowerState,
    RegistrationPhase, ServiceNotifier, ToggleState, VpcDriver,
};
use vpc_protocol::{EcRegister, EcWidth, PowerEvent, PropertyValue};

const DEVICE: &str = "\\_SB.PCI0.LPCB.EC0.VPC0";

async fn attach(stub: &Arc<StubFirmware>, profile: &'static dyn vpc_core::PlatformProfile) -> VpcDriver {
    attach_with(stub, profile, GateOptions::default(), &ServiceNotifier::new()).await
}

async fn attach_with(
    stub: &Arc<StubFirmware>,
    profile: &'static dyn vpc_core::PlatformProfile,
    options: GateOptions,
    notifier: &ServiceNotifier,
) -> VpcDriver {
    let device = DeviceHandle::new(DEVICE, Arc::clone(stub) as Arc<dyn vpc_core::Firmware>);
    VpcDriver::attach(device, profile, options, notifier).await.unwrap()
}

#[tokio::test]
async fn test_attach_syncs_every_toggle() {
    let stub = StubFirmware::ideapad();
    let driver = attach(&stub, &Ideapad).await;

    assert_eq!(
        stub.calls(),
        vec!["_CFG()", "GCSM()", "GBMD()", "GKBL()", "GFAN()", "GFNL()", "GBID()"]
    );
    let snapshot = driver.snapshot();
    assert_eq!(snapshot.platform, "ideapad");
    assert_eq!(snapshot.value(Feature::ConservationMode), Some(1));
    assert_eq!(snapshot.value(Feature::FanControl), Some(2));
    assert_eq!(snapshot.registration, RegistrationPhase::NotifierArmed);
    driver.detach().await.unwrap();
}

#[tokio::test]
async fn test_attach_fails_when_probe_fails() {
    let stub = StubFirmware::ideapad();
    stub.fail("_CFG", Failure::Error);
    let device = DeviceHandle::new(DEVICE, Arc::clone(&stub) as Arc<dyn vpc_core::Firmware>);
    let err = VpcDriver::attach(device, &Ideapad, GateOptions::default(), &ServiceNotifier::new())
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::EvaluationFailed);
    assert_eq!(stub.calls(), vec!["_CFG()"]);
}

#[tokio::test]
async fn test_clamshell_flip_example() {
    let stub = StubFirmware::generic(0);
    let driver = attach(&stub, &Generic).await;
    assert_eq!(driver.snapshot().value(Feature::ClamshellMode), Some(0));

    let outcome = driver.set_property("ClamshellMode", &PropertyValue::None).await.unwrap();
    assert_eq!(outcome, Outcome::Changed { feature: Feature::ClamshellMode, value: 1 });
    assert_eq!(stub.calls(), vec!["GCSM()", "SCSM(1)"]);

    let outcome = driver.set_property("ClamshellMode", &PropertyValue::None).await.unwrap();
    assert_eq!(outcome, Outcome::Changed { feature: Feature::ClamshellMode, value: 0 });
    assert_eq!(stub.calls(), vec!["GCSM()", "SCSM(1)", "SCSM(0)"]);
    assert_eq!(
        driver.snapshot().toggle(Feature::ClamshellMode).map(|t| t.state),
        Some(ToggleState::Valid(0))
    );

    let outcome = driver.set_property("ClamshellMode", &PropertyValue::Bool(false)).await.unwrap();
    assert_eq!(outcome, Outcome::AlreadySet { feature: Feature::ClamshellMode, value: 0 });
    assert_eq!(stub.call_count(), 3);
    driver.detach().await.unwrap();
}

#[tokio::test]
async fn test_unknown_property_touches_nothing() {
    let stub = StubFirmware::generic(0);
    let driver = attach(&stub, &Generic).await;
    let before = stub.call_count();

    let err = driver.set_property("Foo", &PropertyValue::Bool(true)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValueInvalid);
    assert_eq!(stub.call_count(), before);
    driver.detach().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_turns_complete_in_submission_order() {
    const CALLERS: u8 = 16;
    let stub = StubFirmware::generic(0);
    let driver = Arc::new(attach(&stub, &Generic).await);
    let before = stub.call_count();

    // Hold the worker so every caller queues behind it
    let (started_tx, started_rx) = oneshot::channel::<()>();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let gate = driver.gate().clone();
    let blocker = tokio::spawn(async move {
        gate.submit(move |_reg| {
            Box::pin(async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
                Ok(())
            })
        })
        .await
    });
    started_rx.await.unwrap();

    let mut callers = Vec::new();
    for offset in 0..CALLERS {
        let caller_driver = Arc::clone(&driver);
        callers.push(tokio::spawn(async move {
            let register = EcRegister { offset, width: EcWidth::Byte, value: None };
            caller_driver.set_property("ReadEC", &PropertyValue::Register(register)).await
        }));
        // Admit callers one at a time so their queue order is known
        let admitted = usize::from(offset) + 1;
        tokio::time::timeout(Duration::from_secs(5), async {
            while driver.gate().queued() < admitted {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("caller was never admitted");
    }

    release_tx.send(()).unwrap();
    blocker.await.unwrap().unwrap();
    for caller in callers {
        caller.await.unwrap().unwrap();
    }

    let expected: Vec<String> = (0..CALLERS).map(|i| format!("RE1B({})", i)).collect();
    assert_eq!(stub.calls()[before..].to_vec(), expected);

    let driver = Arc::try_unwrap(driver).ok().expect("callers still hold the driver");
    driver.detach().await.unwrap();
}

#[tokio::test]
async fn test_teardown_through_shared_driver() {
    let stub = StubFirmware::generic(1);
    let notifier = ServiceNotifier::new();
    let driver = Arc::new(attach_with(&stub, &Generic, GateOptions::default(), &notifier).await);
    let log = Arc::new(Mutex::new(Vec::new()));

    notifier.publish(RecordingAggregator::new(1, &log));
    wait_for(&driver, |s| s.aggregator_instance == Some(1)).await;

    // A second owner, as a connection task would be
    let busy = Arc::clone(&driver);
    driver.teardown().await.unwrap();

    let snapshot = driver.snapshot();
    assert_eq!(snapshot.registration, RegistrationPhase::Unregistered);
    assert!(!snapshot.bound);
    assert_eq!(*log.lock().unwrap(), vec!["submit:1:YogaVPC:VCSM", "withdraw:1"]);

    let err = busy.set_property("ClamshellMode", &PropertyValue::Bool(false)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);

    notifier.publish(RecordingAggregator::new(2, &log));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(log.lock().unwrap().len(), 2);

    drop(busy);
    let driver = Arc::try_unwrap(driver).ok().expect("driver still shared");
    driver.detach().await.unwrap();
}

#[tokio::test]
async fn test_resume_resyncs_with_partial_failure() {
    let stub = StubFirmware::ideapad();
    let driver = attach(&stub, &Ideapad).await;

    assert!(driver.power_event(PowerEvent::Sleep).await.unwrap().is_none());
    assert_eq!(driver.snapshot().power, PowerState::Sleeping);

    // Hardware changed while asleep, and one method broke
    stub.value("GCSM", 1);
    stub.fail("GBMD", Failure::Error);

    let report = driver.power_event(PowerEvent::Resume).await.unwrap().unwrap();
    assert_eq!(report.entries.len(), 6);
    assert_eq!(report.failures(), 1);
    assert!(report.entry(Feature::ConservationMode).unwrap().error.is_some());
    assert_eq!(report.entry(Feature::ClamshellMode).unwrap().value, Some(1));

    let snapshot = driver.snapshot();
    assert_eq!(snapshot.power, PowerState::Active);
    assert_eq!(snapshot.toggle(Feature::ConservationMode).unwrap().state, ToggleState::Invalid);
    assert_eq!(snapshot.value(Feature::ClamshellMode), Some(1));
    assert_eq!(snapshot.value(Feature::FanControl), Some(2));

    // A repeated resume is a no-op
    let before = stub.call_count();
    assert!(driver.power_event(PowerEvent::Resume).await.unwrap().is_none());
    assert_eq!(stub.call_count(), before);
    driver.detach().await.unwrap();
}

#[tokio::test]
async fn test_requests_while_sleeping_are_unavailable() {
    let stub = StubFirmware::generic(0);
    let driver = attach(&stub, &Generic).await;
    driver.power_event(PowerEvent::Sleep).await.unwrap();
    let before = stub.call_count();

    let err = driver.set_property("ClamshellMode", &PropertyValue::Bool(true)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);
    let read = PropertyValue::Register(EcRegister { offset: 0x10, width: EcWidth::Byte, value: None });
    let err = driver.set_property("ReadEC", &read).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);
    assert_eq!(stub.call_count(), before);
    driver.detach().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timed_out_set_invalidates_toggle() {
    let stub = StubFirmware::generic(0);
    let options = GateOptions { turn_timeout: Duration::from_millis(100), queue_depth: 8 };
    let driver = attach_with(&stub, &Generic, options, &ServiceNotifier::new()).await;

    stub.delay("SCSM", Duration::from_millis(400));
    let err = driver.set_property("ClamshellMode", &PropertyValue::Bool(true)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    wait_for(&driver, |s| {
        s.toggle(Feature::ClamshellMode).map(|t| t.state) == Some(ToggleState::Invalid)
    })
    .await;

    // The serializer keeps going
    stub.delay("SCSM", Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(500)).await;
    let outcome = driver.set_property("ClamshellMode", &PropertyValue::Bool(true)).await.unwrap();
    assert!(matches!(
        outcome,
        Outcome::Changed { value: 1, .. } | Outcome::AlreadySet { value: 1, .. }
    ));
    assert_eq!(driver.snapshot().value(Feature::ClamshellMode), Some(1));
    driver.detach().await.unwrap();
}

#[tokio::test]
async fn test_missing_method_short_circuits() {
    let stub = StubFirmware::ideapad();
    stub.remove("GFNL");
    let driver = attach(&stub, &Ideapad).await;
    assert!(driver.snapshot().toggle(Feature::FnLock).unwrap().missing);
    let before = stub.call_count();

    let err = driver.set_property("FnlockMode", &PropertyValue::Bool(true)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MethodMissing);
    assert_eq!(stub.call_count(), before);

    // Resync skips it too
    driver.set_property("Update", &PropertyValue::None).await.unwrap();
    assert!(!stub.calls()[before..].iter().any(|c| c.starts_with("GFNL")));
    driver.detach().await.unwrap();
}

#[tokio::test]
async fn test_read_only_battery_and_config_dump() {
    let stub = StubFirmware::ideapad();
    let driver = attach(&stub, &Ideapad).await;

    let outcome = driver.set_property("Battery", &PropertyValue::Int(1)).await.unwrap();
    assert_eq!(outcome, Outcome::Value { property: "Battery", value: 0x55 });

    match driver.set_property("VPCconfig", &PropertyValue::None).await.unwrap() {
        Outcome::Config(entries) => {
            assert_eq!(entries.len(), 2);
            assert_eq!(entries[0].method, "_CFG");
            assert_eq!(entries[0].value, Some(0x0004_0000));
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    match driver.set_property("reset", &PropertyValue::None).await.unwrap() {
        Outcome::Resynced(report) => assert!(report.is_clean()),
        other => panic!("unexpected outcome {:?}", other),
    }
    driver.detach().await.unwrap();
}

#[tokio::test]
async fn test_raw_ec_word_access() {
    let stub = StubFirmware::generic(0);
    let driver = attach(&stub, &Generic).await;
    stub.set_ec_byte(0x40, 0x34);
    stub.set_ec_byte(0x41, 0x12);

    let read = PropertyValue::Register(EcRegister { offset: 0x40, width: EcWidth::Word, value: None });
    let outcome = driver.set_property("ReadEC", &read).await.unwrap();
    assert_eq!(outcome, Outcome::Value { property: "ReadEC", value: 0x1234 });

    let write = PropertyValue::Register(EcRegister { offset: 0x50, width: EcWidth::Word, value: Some(0xBEEF) });
    driver.set_property("WriteEC", &write).await.unwrap();
    assert_eq!(stub.ec_byte(0x50), 0xEF);
    assert_eq!(stub.ec_byte(0x51), 0xBE);
    driver.detach().await.unwrap();
}

#[tokio::test]
async fn test_aggregator_handoffs_withdraw_previous() {
    let stub = StubFirmware::generic(1);
    let notifier = ServiceNotifier::new();
    let driver = attach_with(&stub, &Generic, GateOptions::default(), &notifier).await;
    let log = Arc::new(Mutex::new(Vec::new()));

    notifier.publish(RecordingAggregator::new(1, &log));
    wait_for(&driver, |s| s.aggregator_instance == Some(1)).await;

    notifier.publish(RecordingAggregator::new(2, &log));
    let snapshot = wait_for(&driver, |s| s.aggregator_instance == Some(2)).await;
    assert_eq!(snapshot.registration, RegistrationPhase::Registered);

    assert_eq!(
        *log.lock().unwrap(),
        vec!["submit:1:YogaVPC:VCSM", "withdraw:1", "submit:2:YogaVPC:VCSM"]
    );

    driver.detach().await.unwrap();
    assert_eq!(log.lock().unwrap().last().map(String::as_str), Some("withdraw:2"));
    assert_eq!(notifier.listeners(), 0);
}

#[tokio::test]
async fn test_rejected_handoff_stays_armed() {
    let stub = StubFirmware::generic(1);
    let notifier = ServiceNotifier::new();
    let driver = attach_with(&stub, &Generic, GateOptions::default(), &notifier).await;
    let log = Arc::new(Mutex::new(Vec::new()));

    notifier.publish(RecordingAggregator::rejecting(1, &log));
    notifier.publish(RecordingAggregator::new(2, &log));
    let snapshot = wait_for(&driver, |s| s.aggregator_instance == Some(2)).await;
    assert_eq!(snapshot.registration, RegistrationPhase::Registered);
    assert_eq!(*log.lock().unwrap(), vec!["submit:2:YogaVPC:VCSM"]);
    driver.detach().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_late_handoff_is_withdrawn() {
    let stub = StubFirmware::generic(1);
    let notifier = ServiceNotifier::new();
    let options = GateOptions { turn_timeout: Duration::from_millis(100), queue_depth: 8 };
    let driver = attach_with(&stub, &Generic, options, &notifier).await;
    let log = Arc::new(Mutex::new(Vec::new()));

    notifier.publish(RecordingAggregator::slow(1, &log, Duration::from_millis(400)));
    tokio::time::timeout(Duration::from_secs(5), async {
        while log.lock().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("late handoff was not withdrawn");

    assert_eq!(*log.lock().unwrap(), vec!["submit:1:YogaVPC:VCSM", "withdraw:1"]);
    assert_eq!(driver.snapshot().registration, RegistrationPhase::NotifierArmed);
    assert_eq!(driver.snapshot().aggregator_instance, None);

    driver.detach().await.unwrap();
    assert_eq!(log.lock().unwrap().len(), 2);
}
