//! Tests for the sink policy engine.
use super::{Sink, State};
use crate::config::PortConfig;
use crate::counters::{Counter, CounterType};
use crate::device_policy_manager::DevicePolicyManager;
use crate::dummy::{DUMMY_CAPABILITIES, DummyDriver, DummySinkDevice, DummyTimer, InstantTimer, MAX_FRAME_SIZE};
use crate::policy_engine::Error;
use crate::protocol_layer::message::data::request::FixedVariableSupply;
use crate::protocol_layer::message::data::{Data, request};
use crate::protocol_layer::message::extended::Extended;
use crate::protocol_layer::message::extended::extended_control::{ExtendedControl, ExtendedControlMessageType};
use crate::protocol_layer::message::header::{
    ControlMessageType, DataMessageType, ExtendedMessageType, Header, MessageType, SpecificationRevision,
};
use crate::protocol_layer::message::{Message, Payload};
use crate::{DataRole, PowerRole, Sop};

fn get_policy_engine() -> Sink<DummyDriver<MAX_FRAME_SIZE>, DummyTimer, DummySinkDevice> {
    Sink::new(DummyDriver::new(), DummySinkDevice {}, PortConfig::default())
}

/// Header template for messages that the simulated source originates.
fn source_header_template() -> Header {
    Header::new_template(DataRole::Dfp, PowerRole::Source, SpecificationRevision::R3_X)
}

fn simulate_source_control_message<DPM: DevicePolicyManager>(
    policy_engine: &mut Sink<DummyDriver<MAX_FRAME_SIZE>, DummyTimer, DPM>,
    control_message_type: ControlMessageType,
    message_id: u8,
) {
    let mut buf = [0u8; MAX_FRAME_SIZE];

    let size = Message::new(Header::new_control(
        source_header_template(),
        Counter::new_from_value(CounterType::MessageId, message_id),
        control_message_type,
    ))
    .to_bytes(&mut buf);
    policy_engine
        .protocol_layer
        .driver()
        .inject_received_data(Sop::Sop, &buf[..size]);
}

/// Drive a fresh engine into the Ready state with a 5 V contract.
///
/// Leaves the transmit probe queue empty.
async fn negotiate_to_ready<DPM: DevicePolicyManager>(
    policy_engine: &mut Sink<DummyDriver<MAX_FRAME_SIZE>, DummyTimer, DPM>,
) {
    policy_engine
        .protocol_layer
        .driver()
        .inject_received_data(Sop::Sop, &DUMMY_CAPABILITIES);

    // Startup -> Discovery -> WaitForCapabilities -> EvaluateCapabilities.
    policy_engine.run_step().await.unwrap();
    policy_engine.run_step().await.unwrap();
    policy_engine.run_step().await.unwrap();

    // EvaluateCapabilities -> SelectCapability.
    policy_engine.run_step().await.unwrap();

    // Acknowledge the request and accept it.
    simulate_source_control_message(policy_engine, ControlMessageType::GoodCRC, 0);
    simulate_source_control_message(policy_engine, ControlMessageType::Accept, 1);

    // SelectCapability -> TransitionSink.
    policy_engine.run_step().await.unwrap();

    simulate_source_control_message(policy_engine, ControlMessageType::PsRdy, 2);

    // TransitionSink -> Ready.
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready(..)));

    while policy_engine.protocol_layer.driver().has_transmitted_data() {
        let _ = policy_engine.protocol_layer.driver().probe_transmitted_data();
    }
}

#[tokio::test]
async fn test_negotiation() {
    let mut policy_engine = get_policy_engine();

    policy_engine
        .protocol_layer
        .driver()
        .inject_received_data(Sop::Sop, &DUMMY_CAPABILITIES);

    // Startup -> Discovery.
    policy_engine.run_step().await.unwrap();

    // Discovery -> WaitForCapabilities.
    policy_engine.run_step().await.unwrap();

    // WaitForCapabilities -> EvaluateCapabilities.
    policy_engine.run_step().await.unwrap();

    let good_crc = policy_engine.protocol_layer.driver().probe_transmitted_message();
    assert!(matches!(
        good_crc.header.message_type(),
        MessageType::Control(ControlMessageType::GoodCRC)
    ));

    // EvaluateCapabilities -> SelectCapability.
    policy_engine.run_step().await.unwrap();

    // Acknowledge the request, then accept.
    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 0);
    simulate_source_control_message(&mut policy_engine, ControlMessageType::Accept, 1);

    // SelectCapability -> TransitionSink.
    policy_engine.run_step().await.unwrap();

    let request = policy_engine.protocol_layer.driver().probe_transmitted_message();
    assert!(matches!(
        request.header.message_type(),
        MessageType::Data(DataMessageType::Request)
    ));
    assert_eq!(request.header.message_id(), 0);
    // The default policy selects the vSafe5V PDO at its full 3 A.
    let Some(Payload::Data(Data::Request(request::PowerSource::Unknown(raw)))) = request.payload else {
        panic!("expected request payload");
    };
    assert_eq!(raw.object_position(), 1);
    assert_eq!(FixedVariableSupply(raw.0).raw_operating_current(), 300);

    // Simulate PS_RDY.
    simulate_source_control_message(&mut policy_engine, ControlMessageType::PsRdy, 2);

    // TransitionSink -> Ready.
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready(..)));

    // GoodCRCs for Accept and PS_RDY.
    for _ in 0..2 {
        let good_crc = policy_engine.protocol_layer.driver().probe_transmitted_message();
        assert!(matches!(
            good_crc.header.message_type(),
            MessageType::Control(ControlMessageType::GoodCRC)
        ));
    }
}

#[tokio::test]
async fn test_reject_without_contract_returns_to_wait() {
    let mut policy_engine = get_policy_engine();

    policy_engine
        .protocol_layer
        .driver()
        .inject_received_data(Sop::Sop, &DUMMY_CAPABILITIES);

    for _ in 0..4 {
        policy_engine.run_step().await.unwrap();
    }

    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 0);
    simulate_source_control_message(&mut policy_engine, ControlMessageType::Reject, 1);

    // SelectCapability: a Reject without prior contract waits for new
    // capabilities.
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::WaitForCapabilities));
}

#[tokio::test]
async fn test_wait_response_arms_request_timer() {
    let mut policy_engine = get_policy_engine();

    policy_engine
        .protocol_layer
        .driver()
        .inject_received_data(Sop::Sop, &DUMMY_CAPABILITIES);

    for _ in 0..4 {
        policy_engine.run_step().await.unwrap();
    }

    // Reach an explicit contract first, then re-request and get Wait.
    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 0);
    simulate_source_control_message(&mut policy_engine, ControlMessageType::Accept, 1);
    policy_engine.run_step().await.unwrap();
    simulate_source_control_message(&mut policy_engine, ControlMessageType::PsRdy, 2);
    policy_engine.run_step().await.unwrap();

    policy_engine.state = State::SelectCapability(request::PowerSource::FixedVariableSupply(
        FixedVariableSupply(0).with_object_position(1).with_raw_operating_current(100),
    ));
    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);
    simulate_source_control_message(&mut policy_engine, ControlMessageType::Wait, 3);

    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready(_, true)));
}

#[tokio::test]
async fn test_hard_reset_counter_escalates() {
    // Timers expire immediately: SinkWaitCap elapses with no partner, and
    // each hard reset loops back until the counter is exhausted.
    let mut policy_engine: Sink<DummyDriver<MAX_FRAME_SIZE>, InstantTimer, DummySinkDevice> =
        Sink::new(DummyDriver::new(), DummySinkDevice {}, PortConfig::default());

    let result = policy_engine.run().await;
    assert!(matches!(result, Err(Error::PortPartnerUnresponsive)));

    // Three hard resets were signalled before giving up.
    assert_eq!(policy_engine.protocol_layer.driver().hard_resets(), 3);
}

#[tokio::test]
async fn test_get_sink_cap_is_answered() {
    let mut policy_engine = get_policy_engine();
    negotiate_to_ready(&mut policy_engine).await;

    simulate_source_control_message(&mut policy_engine, ControlMessageType::GetSinkCap, 3);

    // Ready -> GiveSinkCap.
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::GiveSinkCap(..)));

    // Acknowledge the response.
    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready(..)));

    // GoodCRC for Get_Sink_Cap, then the capabilities.
    let good_crc = policy_engine.protocol_layer.driver().probe_transmitted_message();
    assert!(matches!(
        good_crc.header.message_type(),
        MessageType::Control(ControlMessageType::GoodCRC)
    ));

    let response = policy_engine.protocol_layer.driver().probe_transmitted_message();
    assert!(matches!(
        response.header.message_type(),
        MessageType::Data(DataMessageType::SinkCapabilities)
    ));
}

#[tokio::test]
async fn test_epr_keep_alive_cycle() {
    let mut policy_engine = get_policy_engine();

    policy_engine.state = State::EprKeepAlive(request::PowerSource::FixedVariableSupply(
        FixedVariableSupply(0).with_object_position(1),
    ));

    // Acknowledge the keep-alive, then answer it.
    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 0);

    let mut ack = Message::new(Header::new_extended(
        source_header_template(),
        Counter::new_from_value(CounterType::MessageId, 0),
        ExtendedMessageType::ExtendedControl,
        1,
    ));
    ack.payload = Some(Payload::Extended(Extended::ExtendedControl(
        ExtendedControl::default().with_message_type(ExtendedControlMessageType::EprKeepAliveAck),
    )));
    let mut buf = [0u8; MAX_FRAME_SIZE];
    let size = ack.to_bytes(&mut buf);
    policy_engine
        .protocol_layer
        .driver()
        .inject_received_data(Sop::Sop, &buf[..size]);

    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready(..)));
    assert!(matches!(policy_engine.mode, super::Mode::Epr));

    // The keep-alive that went out carries the extended control payload.
    let keep_alive = policy_engine.protocol_layer.driver().probe_transmitted_message();
    let Some(Payload::Extended(Extended::ExtendedControl(control))) = keep_alive.payload else {
        panic!("expected extended control payload");
    };
    assert_eq!(control.message_type(), ExtendedControlMessageType::EprKeepAlive);
}

#[tokio::test]
async fn test_unexpected_message_in_ready_gets_not_supported() {
    let mut policy_engine = get_policy_engine();
    negotiate_to_ready(&mut policy_engine).await;

    // An Accept outside any sequence has no business in Ready.
    simulate_source_control_message(&mut policy_engine, ControlMessageType::Accept, 3);

    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::SendNotSupported(..)));
}
