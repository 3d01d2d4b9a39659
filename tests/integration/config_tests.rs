//! Configuration loading tests

use mockall::mock;
use sar_api::{ConfigSource, Error, Register, Result, SarConfig};
use sar_core::SarEngine;
use sar_core::sim::SimAdapter;
use sar_tests::*;

mock! {
    pub Source {}

    impl ConfigSource for Source {
        fn query_configuration(&self) -> Result<SarConfig>;
    }
}

fn start(source: &MockSource) -> Result<TestEngine> {
    SarEngine::new(SimAdapter::new(), RecordingUpstream::new(), source)
}

#[test]
fn test_partial_json_config_keeps_defaults() {
    let config: SarConfig = serde_json::from_str(r#"{ "num_vcs": 256, "small_buffer_size": 1024 }"#).unwrap();
    assert_eq!(config.num_vcs, 256);
    assert_eq!(config.small_buffer_size, 1024);
    assert_eq!(config.big_buffer_size, SarConfig::default().big_buffer_size);
    assert_eq!(config.vc_hash_table_size, 13);

    let engine = engine_with(config);
    assert_eq!(engine.slot_usage().transmit_slots.maximum, 256);
    assert_eq!(engine.device().register(Register::Control2), 256 | (3 << 12));
}

#[test]
fn test_default_control2_encoding() {
    let engine = engine_with(SarConfig::default());
    // 2048-byte small buffers are programmed as 0
    assert_eq!(engine.device().register(Register::Control2), 3 << 12);
    assert_eq!(engine.config().receive_vcs_per_class, 100);
}

#[test]
fn test_source_is_queried_once() {
    let mut source = MockSource::new();
    source.expect_query_configuration().times(1).returning(|| Ok(small_config()));
    let engine = start(&source).unwrap();
    assert_eq!(engine.config().num_vcs, 64);
}

#[test]
fn test_source_error_propagates() {
    let mut source = MockSource::new();
    source
        .expect_query_configuration()
        .returning(|| Err(Error::ConfigError("registry unreadable".into())));
    assert!(matches!(start(&source), Err(Error::ConfigError(_))));
}

#[test]
fn test_invalid_config_is_refused() {
    let cases = [
        SarConfig { small_buffer_size: 100, ..SarConfig::default() },
        SarConfig { big_buffer_size: 32 * 1024, ..SarConfig::default() },
        SarConfig { num_vcs: 0, ..SarConfig::default() },
        SarConfig { receive_buffers_per_pool: 0, ..SarConfig::default() },
    ];
    for config in cases {
        let mut source = MockSource::new();
        source.expect_query_configuration().return_const(Ok(config));
        assert!(matches!(start(&source), Err(Error::ConfigError(_))), "{:?}", config);
    }
}

#[test]
fn test_out_of_range_buffer_total_is_clamped() {
    let engine = engine_with(SarConfig { total_receive_buffers: 10, ..small_config() });
    assert_eq!(engine.config().max_receive_buffers, 48);
    assert_eq!(engine.config().receive_vcs_per_class, 16);
}

#[test]
fn test_statistics_serialize() {
    let engine = engine();
    let vc = open_duplex(&engine, 2);
    engine.send_packets(vc, vec![packet(&engine, 1, &[&payload(10, 0)])]).unwrap();
    complete_transmits(&engine, 1);

    let json = serde_json::to_value(engine.stats()).unwrap();
    assert_eq!(json["xmit_pdus_ok"], 1);
    assert_eq!(json["recv_pdus_ok"], 0);
}
