//! Adapter reset tests

use sar_api::{Aal5Info, CompletionStatus, InterruptStatus, PacketToken, SendOutcome, SizeClass, TxPacket};
use sar_core::hw::RxReportEntry;
use sar_core::transmit::MAX_PAD_TRAILER_BUFFERS;
use sar_core::{QueueDepths, VcLifecycle};
use sar_tests::*;
use spin::Mutex;
use std::sync::Arc;

#[test]
fn test_reset_aborts_every_queued_transmit() {
    let engine = engine();
    let first = open_duplex(&engine, 1);
    let second = open_duplex(&engine, 2);
    let chunk = payload(100, 0);
    // fills the slot ring so later packets sit in DmaWait
    let packets = (1..=18).map(|token| packet(&engine, token, &[&chunk, &chunk, &chunk])).collect();
    engine.send_packets(first, packets).unwrap();
    engine.send_packets(second, vec![packet(&engine, 100, &[&chunk])]).unwrap();
    assert_eq!(engine.queue_depths(first).unwrap().dma_wait, 2);

    assert_eq!(engine.reset().unwrap(), CompletionStatus::Complete);

    let sends = engine.upstream().sends();
    assert_eq!(sends.len(), 19);
    assert!(sends.iter().all(|(_, outcome)| *outcome == SendOutcome::Aborted));
    let first_order: Vec<u64> = sends.iter().map(|(token, _)| token.0).filter(|token| *token < 100).collect();
    assert_eq!(first_order, (1..=18).collect::<Vec<_>>());
    assert_eq!(engine.stats().xmit_pdus_aborted, 19);

    for vc in [first, second] {
        assert_eq!(engine.queue_depths(vc).unwrap(), QueueDepths::default());
        assert_eq!(engine.vc_info(vc).unwrap().references, 1);
        assert_eq!(engine.vc_info(vc).unwrap().lifecycle, VcLifecycle::Active);
    }
    let slots = engine.slot_usage().transmit_slots;
    assert_eq!(slots.remaining, slots.maximum);
    assert_eq!(engine.device().pending_transmits(), 0);
    // an explicit reset reports through its return value only
    assert_eq!(engine.upstream().reset_completions(), 0);
}

#[test]
fn test_reset_aborts_seg_wait_after_dma_completing() {
    let engine = engine();
    let vc = open_duplex(&engine, 3);
    let total = MAX_PAD_TRAILER_BUFFERS as u64 + 3;
    let packets = (1..=total).map(|token| packet(&engine, token, &[&payload(20, 0)])).collect();
    engine.send_packets(vc, packets).unwrap();
    assert_eq!(engine.queue_depths(vc).unwrap().seg_wait, 3);

    engine.reset().unwrap();
    let expected: Vec<_> = (1..=total).map(|token| (PacketToken(token), SendOutcome::Aborted)).collect();
    assert_eq!(engine.upstream().sends(), expected);
}

#[test]
fn test_traffic_resumes_after_reset() {
    let engine = engine();
    let vc = open_duplex(&engine, 4);
    engine.send_packets(vc, vec![packet(&engine, 1, &[&payload(64, 0)])]).unwrap();
    engine.reset().unwrap();
    engine.upstream().clear();

    engine.send_packets(vc, vec![packet(&engine, 2, &[&payload(64, 1)])]).unwrap();
    assert_eq!(complete_transmits(&engine, 1), 1);
    assert_eq!(engine.upstream().sends(), vec![(PacketToken(2), SendOutcome::Success)]);

    let data = payload(700, 2);
    engine.device().deliver_pdu(4, SizeClass::Small, &data, Aal5Info::default()).unwrap();
    engine.handle_interrupt();
    assert_eq!(engine.upstream().received()[0].data, data);
}

#[test]
fn test_reset_abandons_partial_reassembly() {
    let engine = engine();
    let vc = open(&engine, ubr(5, None, Some(9180)));
    let device = engine.device();
    let buffer = device.take_rx_buffer(SizeClass::Big).unwrap();
    let mut start = RxReportEntry::new(buffer.tag, SizeClass::Big, 5);
    start.own = false;
    start.sop = true;
    device.push_rx_report(start);
    engine.handle_interrupt();
    assert_eq!(engine.vc_info(vc).unwrap().references, 2);

    engine.reset().unwrap();
    assert_eq!(engine.vc_info(vc).unwrap().references, 1);
    assert_eq!(device.posted_rx_buffers(SizeClass::Big), 8);
    assert!(engine.upstream().received().is_empty());

    // a fresh packet after the reset is not mixed with the abandoned start
    let data = payload(200, 3);
    device.deliver_pdu(5, SizeClass::Big, &data, Aal5Info::default()).unwrap();
    engine.handle_interrupt();
    assert_eq!(engine.upstream().received()[0].data, data);
    assert_eq!(engine.stats().recv_cells_dropped, 0);
}

#[test]
fn test_fatal_interrupt_resets_and_notifies() {
    let engine = engine();
    let vc = open_duplex(&engine, 6);
    let packets = (1..=3).map(|token| packet(&engine, token, &[&payload(64, 0)])).collect();
    engine.send_packets(vc, packets).unwrap();

    engine.device().raise(InterruptStatus::PCI_FATAL_ERROR);
    assert!(engine.handle_interrupt());

    assert_eq!(engine.upstream().sends(), vec![
        (PacketToken(1), SendOutcome::Aborted),
        (PacketToken(2), SendOutcome::Aborted),
        (PacketToken(3), SendOutcome::Aborted),
    ]);
    assert_eq!(engine.upstream().reset_completions(), 1);
    assert_eq!(engine.device().posted_rx_buffers(SizeClass::Small), 8);

    // hardware failure is cleared once the adapter is reprogrammed
    engine.send_packets(vc, vec![packet(&engine, 4, &[&payload(64, 0)])]).unwrap();
    complete_transmits(&engine, 1);
    assert_eq!(engine.upstream().sends().last(), Some(&(PacketToken(4), SendOutcome::Success)));
}

#[test]
fn test_quiet_adapter_interrupt_is_not_ours() {
    let engine = engine();
    assert!(!engine.handle_interrupt());
}

#[test]
fn test_pending_deactivation_completes_across_reset() {
    let engine = engine();
    let vc = open_duplex(&engine, 7);
    engine.send_packets(vc, vec![packet(&engine, 1, &[&payload(64, 0)])]).unwrap();
    assert_eq!(engine.deactivate_vc(vc).unwrap(), CompletionStatus::Pending);

    engine.reset().unwrap();
    assert_eq!(engine.upstream().sends(), vec![(PacketToken(1), SendOutcome::Aborted)]);
    assert_eq!(engine.upstream().deactivated(), vec![vc]);
    assert_eq!(engine.vc_info(vc).unwrap().lifecycle, VcLifecycle::Inactive);
    engine.delete_vc(vc).unwrap();
}

#[test]
fn test_retained_packet_survives_reset() {
    let engine = engine();
    let vc = open_duplex(&engine, 8);
    engine.upstream().set_mode(ReceiveMode::Retain);
    engine.device().deliver_pdu(8, SizeClass::Small, &payload(100, 0), Aal5Info::default()).unwrap();
    engine.handle_interrupt();
    let token = engine.upstream().received()[0].token;

    engine.reset().unwrap();
    assert_eq!(engine.vc_info(vc).unwrap().references, 2);
    assert_eq!(engine.device().posted_rx_buffers(SizeClass::Small), 7);

    engine.return_packet(token).unwrap();
    assert_eq!(engine.vc_info(vc).unwrap().references, 1);
    assert_eq!(engine.device().posted_rx_buffers(SizeClass::Small), 8);
}

#[test]
fn test_reset_requested_inside_send_batch_runs_after_it() {
    let engine = shared_engine();
    let vc = open_duplex(&engine, 10);
    let status = Arc::new(Mutex::new(None));
    let seen = status.clone();
    let weak = Arc::downgrade(&engine);
    engine.upstream().on_send(move |token, outcome| {
        if token == PacketToken(2) && outcome == SendOutcome::Failed {
            if let Some(engine) = weak.upgrade() {
                *seen.lock() = Some(engine.reset().unwrap());
            }
        }
    });

    let malformed = TxPacket::new(PacketToken(2), Vec::new());
    engine.send_packets(vc, vec![packet(&engine, 1, &[&payload(64, 0)]), malformed]).unwrap();

    assert_eq!(*status.lock(), Some(CompletionStatus::Pending));
    assert_eq!(engine.upstream().sends(), vec![
        (PacketToken(2), SendOutcome::Failed),
        (PacketToken(1), SendOutcome::Aborted),
    ]);
    assert_eq!(engine.upstream().reset_completions(), 1);
    assert_eq!(engine.queue_depths(vc).unwrap(), QueueDepths::default());
    assert_eq!(engine.vc_info(vc).unwrap().references, 1);
    let slots = engine.slot_usage().transmit_slots;
    assert_eq!(slots.remaining, slots.maximum);
    assert_eq!(engine.device().pending_transmits(), 0);
}

#[test]
fn test_reset_from_nested_interrupt_waits_for_outer_pass() {
    let engine = shared_engine();
    let vc = open_duplex(&engine, 11);
    let packets = (1..=2).map(|token| packet(&engine, token, &[&payload(64, 0)])).collect();
    engine.send_packets(vc, packets).unwrap();

    let status = Arc::new(Mutex::new(None));
    let seen = status.clone();
    let weak = Arc::downgrade(&engine);
    engine.upstream().on_send(move |token, outcome| {
        let Some(engine) = weak.upgrade() else {
            return;
        };
        if outcome != SendOutcome::Success {
            return;
        }
        if token == PacketToken(1) {
            // a second interrupt pass starts and finishes inside the first
            engine.device().raise(InterruptStatus::TX_IOC);
            engine.handle_interrupt();
        } else if token == PacketToken(2) {
            *seen.lock() = Some(engine.reset().unwrap());
        }
    });

    assert_eq!(complete_transmits(&engine, 2), 2);

    assert_eq!(*status.lock(), Some(CompletionStatus::Pending));
    assert_eq!(engine.upstream().sends(), vec![
        (PacketToken(1), SendOutcome::Success),
        (PacketToken(2), SendOutcome::Success),
    ]);
    assert_eq!(engine.upstream().reset_completions(), 1);
    assert_eq!(engine.vc_info(vc).unwrap().references, 1);
}
