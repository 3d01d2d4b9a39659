//! Receive reassembly tests
//!
//! The simulated adapter fills posted buffers and writes receive reports;
//! the engine reassembles them on the next interrupt.

use mockall::mock;
use sar_api::{
    Aal5Info, CompletionStatus, Error, PacketDisposition, PacketToken, ReceivedPacket, Result, RxPacketToken,
    SendOutcome, SizeClass, Upstream, VcHandle,
};
use sar_core::{SarEngine, VcLifecycle};
use sar_core::hw::{RxReportEntry, RxStatus};
use sar_core::sim::SimAdapter;
use sar_tests::*;

const BIG_POOL: usize = 8;

fn open_big(engine: &TestEngine, vci: u16) -> VcHandle {
    open(engine, ubr(vci, None, Some(9180)))
}

#[test]
fn test_single_buffer_round_trip() {
    let engine = engine();
    let vc = open_duplex(&engine, 7);
    assert_eq!(engine.vc_info(vc).unwrap().class, Some(SizeClass::Small));
    assert_eq!(engine.device().posted_rx_buffers(SizeClass::Small), 8);

    let data = payload(1000, 9);
    let info = Aal5Info { user_to_user: 0x12, common_part_indicator: 0 };
    assert_eq!(engine.device().deliver_pdu(7, SizeClass::Small, &data, info), Some(1));
    engine.handle_interrupt();

    let received = engine.upstream().received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].vc, vc);
    assert_eq!(received[0].data, data);
    assert_eq!(received[0].aal5, info);
    assert_eq!(received[0].buffer_count, 1);

    let stats = engine.stats();
    assert_eq!(stats.recv_pdus_ok, 1);
    assert_eq!(stats.recv_cells_ok, 1);
    assert_eq!(engine.device().posted_rx_buffers(SizeClass::Small), 8);
    assert_eq!(engine.vc_info(vc).unwrap().references, 1);
}

#[test]
fn test_multi_buffer_round_trip() {
    let engine = engine();
    let vc = open_big(&engine, 9);
    assert_eq!(engine.vc_info(vc).unwrap().class, Some(SizeClass::Big));

    let data = payload(9000, 4);
    assert_eq!(engine.device().deliver_pdu(9, SizeClass::Big, &data, Aal5Info::default()), Some(2));
    engine.handle_interrupt();

    let received = engine.upstream().received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].data, data);
    assert_eq!(received[0].buffer_count, 2);
    assert_eq!(engine.vc_stats(vc).unwrap().recv_cells_ok, 2);
    assert_eq!(engine.device().posted_rx_buffers(SizeClass::Big), BIG_POOL);
}

#[test]
fn test_bad_fragment_discards_whole_packet() {
    let engine = engine();
    let vc = open_big(&engine, 9);
    let pdu = aal5_pdu(&payload(20_000, 1), Aal5Info::default());

    assert_eq!(engine.device().deliver_raw(9, SizeClass::Big, &pdu, RxStatus::Crc32, true), Some(3));
    engine.handle_interrupt();

    assert!(engine.upstream().received().is_empty());
    assert_eq!(engine.stats().recv_crc_error, 1);
    assert_eq!(engine.stats().recv_pdus_ok, 0);
    assert_eq!(engine.vc_info(vc).unwrap().references, 1);
    assert_eq!(engine.device().posted_rx_buffers(SizeClass::Big), BIG_POOL);
}

#[test]
fn test_discard_reasons_map_to_counters() {
    let engine = engine();
    open_big(&engine, 9);
    let pdu = aal5_pdu(&payload(100, 0), Aal5Info::default());
    let statuses = [RxStatus::SlotCongestion, RxStatus::ReassemblyTimeout, RxStatus::Length, RxStatus::OtherCell];
    for status in statuses {
        engine.device().deliver_raw(9, SizeClass::Big, &pdu, status, true).unwrap();
        engine.handle_interrupt();
    }

    let stats = engine.stats();
    assert_eq!(stats.recv_cells_dropped, 1);
    assert_eq!(stats.recv_reassembly_err, 1);
    assert_eq!(stats.recv_pdus_error, 1);
    assert_eq!(stats.recv_pdus_no_buffer, 1);
    assert!(engine.upstream().received().is_empty());
}

#[test]
fn test_inconsistent_trailer_length_is_dropped() {
    let engine = engine();
    let vc = open_big(&engine, 9);
    let mut pdu = aal5_pdu(&payload(100, 0), Aal5Info::default());
    // claim more payload than the PDU carries
    let at = pdu.len() - 6;
    pdu[at..at + 2].copy_from_slice(&500u16.to_be_bytes());

    engine.device().deliver_raw(9, SizeClass::Big, &pdu, RxStatus::Crc32, false).unwrap();
    engine.handle_interrupt();

    assert!(engine.upstream().received().is_empty());
    assert_eq!(engine.stats().recv_cells_dropped, 1);
    assert_eq!(engine.vc_info(vc).unwrap().references, 1);
    assert_eq!(engine.device().posted_rx_buffers(SizeClass::Big), BIG_POOL);
}

#[test]
fn test_reports_are_taken_in_ring_order_not_tag_order() {
    let engine = engine();
    let vc = open_big(&engine, 9);
    let device = engine.device();
    let first = device.take_rx_buffer(SizeClass::Big).unwrap();
    let second = device.take_rx_buffer(SizeClass::Big).unwrap();
    assert_eq!((first.tag, second.tag), (1, 2));

    let pdu = aal5_pdu(&payload(9000, 2), Aal5Info::default());
    device.write_memory(first.addr, &pdu[..8192]);
    device.write_memory(second.addr, &pdu[8192..]);

    // end of packet reported before its start
    let mut end = RxReportEntry::new(second.tag, SizeClass::Big, 9);
    end.own = false;
    end.eop = true;
    end.size_words = RxReportEntry::size_words_for(pdu.len() - 8192);
    let mut start = RxReportEntry::new(first.tag, SizeClass::Big, 9);
    start.own = false;
    start.sop = true;
    device.push_rx_report(end);
    device.push_rx_report(start);
    engine.handle_interrupt();

    assert!(engine.upstream().received().is_empty());
    // the start opened an assembly that is still waiting for its end
    assert_eq!(engine.vc_info(vc).unwrap().references, 2);

    let data = payload(300, 5);
    engine.device().deliver_pdu(9, SizeClass::Big, &data, Aal5Info::default()).unwrap();
    engine.handle_interrupt();

    let received = engine.upstream().received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].data, data);
    assert_eq!(engine.stats().recv_cells_dropped, 1);
    assert_eq!(engine.vc_info(vc).unwrap().references, 1);
}

#[test]
fn test_missing_start_of_packet_is_dropped() {
    let engine = engine();
    let vc = open_big(&engine, 9);
    let device = engine.device();
    let buffer = device.take_rx_buffer(SizeClass::Big).unwrap();
    let mut entry = RxReportEntry::new(buffer.tag, SizeClass::Big, 9);
    entry.own = false;
    entry.eop = true;
    entry.size_words = 12;
    device.push_rx_report(entry);
    engine.handle_interrupt();

    assert!(engine.upstream().received().is_empty());
    assert_eq!(engine.vc_info(vc).unwrap().references, 1);
    assert_eq!(device.posted_rx_buffers(SizeClass::Big), BIG_POOL);
}

#[test]
fn test_mistagged_size_class_falls_back_to_other_queue() {
    let engine = engine();
    open_big(&engine, 9);
    let device = engine.device();
    let buffer = device.take_rx_buffer(SizeClass::Big).unwrap();
    let data = payload(100, 8);
    let pdu = aal5_pdu(&data, Aal5Info::default());
    device.write_memory(buffer.addr, &pdu);

    let mut entry = RxReportEntry::new(buffer.tag, SizeClass::Small, 9);
    entry.own = false;
    entry.sop = true;
    entry.eop = true;
    entry.size_words = RxReportEntry::size_words_for(pdu.len());
    device.push_rx_report(entry);
    engine.handle_interrupt();

    let received = engine.upstream().received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].data, data);
}

#[test]
fn test_unknown_tag_is_skipped_and_later_reports_still_processed() {
    let engine = engine();
    open_big(&engine, 9);
    let device = engine.device();
    let mut bogus = RxReportEntry::new(4000, SizeClass::Big, 9);
    bogus.own = false;
    bogus.sop = true;
    bogus.eop = true;
    device.push_rx_report(bogus);
    let data = payload(64, 1);
    device.deliver_pdu(9, SizeClass::Big, &data, Aal5Info::default()).unwrap();
    engine.handle_interrupt();

    let received = engine.upstream().received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].data, data);
}

#[test]
fn test_report_for_unknown_circuit_returns_buffer() {
    let engine = engine();
    open_duplex(&engine, 7);
    engine.device().deliver_pdu(40, SizeClass::Small, &payload(50, 0), Aal5Info::default()).unwrap();
    engine.handle_interrupt();

    assert!(engine.upstream().received().is_empty());
    assert_eq!(engine.stats().recv_invalid_vpi_vci, 1);
    assert_eq!(engine.device().posted_rx_buffers(SizeClass::Small), 8);
}

#[test]
fn test_retained_packet_holds_buffers_until_returned() {
    let engine = engine();
    let vc = open_duplex(&engine, 7);
    engine.upstream().set_mode(ReceiveMode::Retain);

    engine.device().deliver_pdu(7, SizeClass::Small, &payload(500, 0), Aal5Info::default()).unwrap();
    engine.handle_interrupt();

    let token = engine.upstream().received()[0].token;
    assert_eq!(engine.vc_info(vc).unwrap().references, 2);
    assert_eq!(engine.slot_usage().held_packets, 1);
    assert_eq!(engine.device().posted_rx_buffers(SizeClass::Small), 7);

    engine.return_packet(token).unwrap();
    assert_eq!(engine.vc_info(vc).unwrap().references, 1);
    assert_eq!(engine.slot_usage().held_packets, 0);
    assert_eq!(engine.device().posted_rx_buffers(SizeClass::Small), 8);
    assert!(matches!(engine.return_packet(token), Err(Error::NotFound(_))));
    assert!(matches!(engine.return_packet(RxPacketToken(777)), Err(Error::NotFound(_))));
}

#[test]
fn test_deactivation_waits_for_retained_packet() {
    let engine = engine();
    let vc = open_duplex(&engine, 7);
    engine.upstream().set_mode(ReceiveMode::Retain);
    engine.device().deliver_pdu(7, SizeClass::Small, &payload(500, 0), Aal5Info::default()).unwrap();
    engine.handle_interrupt();
    let token = engine.upstream().received()[0].token;

    assert_eq!(engine.deactivate_vc(vc).unwrap(), CompletionStatus::Pending);
    assert!(engine.upstream().deactivated().is_empty());

    engine.return_packet(token).unwrap();
    assert_eq!(engine.upstream().deactivated(), vec![vc]);
    assert_eq!(engine.vc_info(vc).unwrap().lifecycle, VcLifecycle::Inactive);
}

mock! {
    pub Receiver {}

    impl Upstream for Receiver {
        fn packet_received(&self, vc: VcHandle, packet: &ReceivedPacket) -> Result<PacketDisposition>;
        fn send_complete(&self, vc: VcHandle, token: PacketToken, outcome: SendOutcome);
        fn deactivate_complete(&self, vc: VcHandle);
        fn reset_complete(&self);
    }
}

#[test]
fn test_busy_receiver_gets_buffers_reclaimed() {
    let mut receiver = MockReceiver::new();
    receiver
        .expect_packet_received()
        .times(1)
        .returning(|_, _| Err(Error::Busy("no receive descriptors".into())));
    receiver.expect_send_complete().never();

    let engine = SarEngine::new(SimAdapter::new(), receiver, &small_config()).unwrap();
    let vc = engine.create_vc();
    engine.activate_vc(vc, &ubr(7, None, Some(1500))).unwrap();
    assert_eq!(engine.device().posted_rx_buffers(SizeClass::Small), 8);

    engine.device().deliver_pdu(7, SizeClass::Small, &payload(3000, 0), Aal5Info::default());
    engine.handle_interrupt();

    assert_eq!(engine.vc_info(vc).unwrap().references, 1);
    assert_eq!(engine.slot_usage().held_packets, 0);
    assert_eq!(engine.device().posted_rx_buffers(SizeClass::Small), 8);
}
