//! Property tests for framing and end-to-end ordering

use proptest::prelude::*;
use sar_api::{Aal5Info, PacketToken, SendOutcome, SizeClass};
use sar_core::aal5::{padding_bytes, pdu_length, CELL_PAYLOAD_SIZE, MAX_APPEND_BYTES};
use sar_tests::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_padding_fills_whole_cells(len in 1usize..=65_535) {
        let total = pdu_length(len);
        prop_assert_eq!(total % CELL_PAYLOAD_SIZE, 0);
        prop_assert!(padding_bytes(len) < CELL_PAYLOAD_SIZE);
        prop_assert!(total - len <= MAX_APPEND_BYTES);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_transmits_complete_in_submission_order(
        sizes in prop::collection::vec(prop::collection::vec(1usize..2000, 1..4), 1..40),
        batch in 1usize..8,
    ) {
        let engine = engine();
        let vc = open_duplex(&engine, 3);
        let mut expected = Vec::new();
        let mut packets = Vec::new();
        for (n, fragments) in sizes.iter().enumerate() {
            let chunks: Vec<Vec<u8>> = fragments.iter().map(|len| payload(*len, n as u8)).collect();
            let refs: Vec<&[u8]> = chunks.iter().map(Vec::as_slice).collect();
            packets.push(packet(&engine, n as u64 + 1, &refs));
            expected.push(chunks.concat());
        }

        engine.send_packets(vc, packets).unwrap();
        while complete_transmits(&engine, batch) > 0 {}

        let outcomes: Vec<_> = (1..=sizes.len() as u64).map(|token| (PacketToken(token), SendOutcome::Success)).collect();
        prop_assert_eq!(engine.upstream().sends(), outcomes);
        let wire = engine.device().transmitted();
        prop_assert_eq!(wire.len(), expected.len());
        for (pdu, data) in wire.iter().zip(&expected) {
            prop_assert_eq!(pdu.payload(), Some(data.as_slice()));
        }
        prop_assert_eq!(engine.vc_info(vc).unwrap().references, 1);
    }

    #[test]
    fn prop_received_packets_match_what_was_sent(len in 1usize..=20_000, user_to_user in any::<u8>()) {
        let engine = engine();
        let vc = open(&engine, ubr(4, None, Some(20_000)));
        let data = payload(len, user_to_user);
        let info = Aal5Info { user_to_user, common_part_indicator: 0 };

        let used = engine.device().deliver_pdu(4, SizeClass::Big, &data, info).unwrap();
        engine.handle_interrupt();

        let received = engine.upstream().received();
        prop_assert_eq!(received.len(), 1);
        prop_assert_eq!(&received[0].data, &data);
        prop_assert_eq!(received[0].aal5, info);
        prop_assert_eq!(received[0].buffer_count, used);
        prop_assert_eq!(engine.vc_info(vc).unwrap().references, 1);
    }
}
