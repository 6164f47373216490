//! Tests for the source policy engine.
use heapless::Vec;

use super::{Source, State};
use crate::config::{PortConfig, PortRole};
use crate::counters::{Counter, CounterType};
use crate::device_policy_manager::DevicePolicyManager;
use crate::dummy::{DummyDriver, DummySourceDevice, InstantTimer, MAX_FRAME_SIZE};
use crate::policy_engine::EngineOutcome;
use crate::protocol_layer::message::data::request::{EprRequestDataObject, FixedVariableSupply};
use crate::protocol_layer::message::data::source_capabilities::{FixedSupply, parse_raw_pdo};
use crate::protocol_layer::message::data::{Data, request};
use crate::protocol_layer::message::header::{
    ControlMessageType, DataMessageType, Header, MessageType, SpecificationRevision,
};
use crate::protocol_layer::message::{Message, Payload};
use crate::{DataRole, PowerRole, Sop};

/// A 5 V / 3 A fixed source PDO, EPR capable.
const PDO_5V_3A: u32 = 0x0881_912C;
/// A 28 V / 5 A EPR fixed source PDO.
const PDO_EPR_28V_5A: u32 = 0x0008_C1F4;

fn source_config() -> PortConfig {
    let mut src_pdos = Vec::new();
    src_pdos.push(PDO_5V_3A).unwrap();

    PortConfig {
        role: PortRole::Source,
        default_role: PowerRole::Source,
        cable_discovery_enabled: false,
        src_pdos,
        src_pdo_mask: 0x01,
        ..Default::default()
    }
}

fn get_policy_engine() -> Source<DummyDriver<MAX_FRAME_SIZE>, InstantTimer, DummySourceDevice> {
    Source::new(DummyDriver::new(), DummySourceDevice {}, source_config())
}

/// Header template for messages that the simulated sink originates.
fn sink_header_template() -> Header {
    Header::new_template(DataRole::Ufp, PowerRole::Sink, SpecificationRevision::R3_X)
}

fn simulate_sink_control_message<DPM: DevicePolicyManager>(
    policy_engine: &mut Source<DummyDriver<MAX_FRAME_SIZE>, InstantTimer, DPM>,
    control_message_type: ControlMessageType,
    message_id: u8,
) {
    let mut buf = [0u8; MAX_FRAME_SIZE];

    let size = Message::new(Header::new_control(
        sink_header_template(),
        Counter::new_from_value(CounterType::MessageId, message_id),
        control_message_type,
    ))
    .to_bytes(&mut buf);
    policy_engine
        .protocol_layer
        .driver()
        .inject_received_data(Sop::Sop, &buf[..size]);
}

fn simulate_sink_request<DPM: DevicePolicyManager>(
    policy_engine: &mut Source<DummyDriver<MAX_FRAME_SIZE>, InstantTimer, DPM>,
    rdo: FixedVariableSupply,
    message_id: u8,
) {
    let header = Header::new_data(
        sink_header_template(),
        Counter::new_from_value(CounterType::MessageId, message_id),
        DataMessageType::Request,
        1,
    );
    let message = Message::new_with_data(
        header,
        Data::Request(request::PowerSource::FixedVariableSupply(rdo)),
    );

    let mut buf = [0u8; MAX_FRAME_SIZE];
    let size = message.to_bytes(&mut buf);
    policy_engine
        .protocol_layer
        .driver()
        .inject_received_data(Sop::Sop, &buf[..size]);
}

#[tokio::test]
async fn test_source_negotiation() {
    let mut policy_engine = get_policy_engine();

    // Startup -> SendCapabilities (cable discovery disabled).
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::SendCapabilities));

    // Acknowledge the advertisement, then request 5 V at 3 A.
    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 0);
    simulate_sink_request(
        &mut policy_engine,
        FixedVariableSupply(0)
            .with_object_position(1)
            .with_raw_operating_current(300)
            .with_raw_max_operating_current(300),
        0,
    );

    // SendCapabilities -> NegotiateCapability.
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::NegotiateCapability(_)));

    let capabilities = policy_engine.protocol_layer.driver().probe_transmitted_message();
    assert!(matches!(
        capabilities.header.message_type(),
        MessageType::Data(DataMessageType::SourceCapabilities)
    ));
    let Some(Payload::Data(Data::SourceCapabilities(advertised))) = capabilities.payload else {
        panic!("expected source capabilities payload");
    };
    assert_eq!(advertised.pdos(), &[parse_raw_pdo(PDO_5V_3A)]);

    // GoodCRC for the request.
    let good_crc = policy_engine.protocol_layer.driver().probe_transmitted_message();
    assert!(matches!(
        good_crc.header.message_type(),
        MessageType::Control(ControlMessageType::GoodCRC)
    ));

    // Acknowledgements for Accept and PS_RDY.
    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);
    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 2);

    // NegotiateCapability -> TransitionSupply -> Ready.
    policy_engine.run_step().await.unwrap();
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready(_)));
    assert!(policy_engine.contract.is_some());

    let accept = policy_engine.protocol_layer.driver().probe_transmitted_message();
    assert!(matches!(
        accept.header.message_type(),
        MessageType::Control(ControlMessageType::Accept)
    ));

    let ps_rdy = policy_engine.protocol_layer.driver().probe_transmitted_message();
    assert!(matches!(
        ps_rdy.header.message_type(),
        MessageType::Control(ControlMessageType::PsRdy)
    ));
}

#[tokio::test]
async fn test_out_of_range_object_position_is_rejected() {
    let mut policy_engine = get_policy_engine();

    policy_engine.run_step().await.unwrap();

    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 0);
    // Object position 3 addresses nothing in a one-PDO advertisement.
    simulate_sink_request(
        &mut policy_engine,
        FixedVariableSupply(0)
            .with_object_position(3)
            .with_raw_operating_current(100),
        0,
    );
    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);

    policy_engine.run_step().await.unwrap();
    policy_engine.run_step().await.unwrap();

    // Without a prior contract, the port waits for a usable request.
    assert!(matches!(policy_engine.state, State::WaitNewCapabilities));

    // Advertisement, request GoodCRC, then the Reject.
    let _capabilities = policy_engine.protocol_layer.driver().probe_transmitted_data();
    let _good_crc = policy_engine.protocol_layer.driver().probe_transmitted_data();
    let reject = policy_engine.protocol_layer.driver().probe_transmitted_message();
    assert!(matches!(
        reject.header.message_type(),
        MessageType::Control(ControlMessageType::Reject)
    ));
}

#[tokio::test]
async fn test_excessive_current_is_rejected() {
    let mut policy_engine = get_policy_engine();

    policy_engine.run_step().await.unwrap();

    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 0);
    // 5 A from a 3 A PDO.
    simulate_sink_request(
        &mut policy_engine,
        FixedVariableSupply(0)
            .with_object_position(1)
            .with_raw_operating_current(500)
            .with_raw_max_operating_current(500),
        0,
    );
    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);

    policy_engine.run_step().await.unwrap();
    policy_engine.run_step().await.unwrap();

    assert!(matches!(policy_engine.state, State::WaitNewCapabilities));
}

#[tokio::test]
async fn test_epr_mirror_mismatch_forces_hard_reset() {
    let mut config = source_config();
    config.epr_src_pdos.push(PDO_EPR_28V_5A).unwrap();
    config.epr_src_pdo_mask = 0x01;

    let mut policy_engine: Source<DummyDriver<MAX_FRAME_SIZE>, InstantTimer, DummySourceDevice> =
        Source::new(DummyDriver::new(), DummySourceDevice {}, config);

    // Force EPR mode with the extended advertisement in place.
    policy_engine.mode = super::Mode::Epr;
    policy_engine.advertised = policy_engine.epr_advertisement();
    policy_engine.state = State::NegotiateCapability(request::PowerSource::EprRequest(EprRequestDataObject {
        rdo: FixedVariableSupply(0)
            .with_object_position(8)
            .with_raw_operating_current(500)
            .0,
        // The mirrored PDO does not match the advertisement at position 8.
        pdo: crate::protocol_layer::message::data::source_capabilities::PowerDataObject::FixedSupply(FixedSupply(
            0x0001_0000,
        )),
    }));

    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::HardReset));
}

#[tokio::test]
async fn test_unanswered_capabilities_declare_non_pd_partner() {
    // Nothing ever acknowledges the advertisement: after the configured try
    // count, the connection falls back to Type-C only.
    let mut policy_engine = get_policy_engine();

    let outcome = policy_engine.run().await.unwrap();
    assert_eq!(outcome, EngineOutcome::NonPdPartner);

    // Each of the six tries transmitted the full retry burst of three.
    let mut transmitted = 0;
    while policy_engine.protocol_layer.driver().has_transmitted_data() {
        let message = policy_engine.protocol_layer.driver().probe_transmitted_message();
        assert!(matches!(
            message.header.message_type(),
            MessageType::Data(DataMessageType::SourceCapabilities)
        ));
        transmitted += 1;
    }
    assert_eq!(transmitted, 18);
}
