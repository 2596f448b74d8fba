mod common;

use common::*;
use gro_rs::{AggregationParams, Disposition, GroFlags, GroStats, TimeoutFlush, TimerGranularity};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const FLOW: u64 = 0x3000;

fn collecting_params(sink: &Arc<Mutex<Vec<TimeoutFlush>>>, arg: u64) -> AggregationParams {
    let sink = sink.clone();
    AggregationParams::builder()
        .seg_num_limit(10)
        .packet_size_limit(1000)
        .timeout_limit(10)
        .on_timeout(move |flush| sink.lock().push(flush), arg)
        .build()
        .unwrap()
}

#[test]
fn timeout_flushes_to_the_completion_callback() {
    init_logger();
    let engine = engine();
    let flushed = Arc::new(Mutex::new(Vec::new()));
    let params = collecting_params(&flushed, 7);
    for seg in run(1000, 2, 60) {
        let out = engine.aggregate_segment(FLOW, seg.frame(), &params, GroFlags::TCP_CHECKSUM);
        assert!(out.frames().next().is_none());
    }

    assert!(engine.timers().advance(Duration::from_millis(9)).is_empty());
    let events = engine.timers().advance(Duration::from_millis(1));
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].context_addr, FLOW);
    for event in events {
        engine.timeout_callback(event);
    }

    let flushed = flushed.lock();
    assert_eq!(flushed.len(), 1);
    assert_eq!(flushed[0].context_addr, FLOW);
    assert_eq!(flushed[0].arg, 7);
    assert_eq!(flushed[0].aggregate.len(), 160);
    assert_eq!(flushed[0].aggregate.segment_count(), 2);

    assert!(!engine.context(FLOW).is_active());
    assert_eq!(engine.timers().in_use(0), 0);
    let stats = GroStats::read(engine.counters(), 0);
    assert_eq!(stats.timeout_flushes, 1);
    assert_eq!(stats.aggregations, 1);
}

#[test]
fn granularity_scales_the_timeout() {
    let engine = engine();
    let params = AggregationParams::builder()
        .timeout_limit(3)
        .granularity(TimerGranularity::Millis100)
        .build()
        .unwrap();
    engine.aggregate_segment(FLOW, Seg::new(1).frame(), &params, GroFlags::empty());
    assert!(engine.timers().advance(Duration::from_millis(299)).is_empty());
    assert_eq!(engine.timers().advance(Duration::from_millis(1)).len(), 1);
}

#[test]
fn timeout_without_completion_drops_the_aggregate() {
    let engine = engine();
    let params = params(10, 1000);
    engine.aggregate_segment(FLOW, Seg::new(1).frame(), &params, GroFlags::empty());
    for event in engine.timers().advance(Duration::from_millis(10)) {
        engine.timeout_callback(event);
    }
    assert!(!engine.context(FLOW).is_active());
    assert_eq!(engine.frames().frames_in_use(), 0);
    assert_eq!(engine.timers().in_use(0), 0);
    assert_eq!(GroStats::read(engine.counters(), 0).timeout_flushes, 1);
}

#[test]
fn stale_timer_event_leaves_the_next_aggregation_alone() {
    init_logger();
    let engine = engine();
    let flushed = Arc::new(Mutex::new(Vec::new()));
    let params = collecting_params(&flushed, 1);
    engine.aggregate_segment(FLOW, Seg::new(1000).frame(), &params, GroFlags::empty());

    // The timer fires, but the flow is flushed before the event is handled.
    let stale = engine.timers().advance(Duration::from_millis(10));
    assert_eq!(stale.len(), 1);
    let out = engine.flush_aggregation(FLOW);
    assert_eq!(out.disposition, Disposition::FLUSH_AGG_DONE);

    // A new aggregation starts, likely on the very same timer slot.
    engine.aggregate_segment(FLOW, Seg::new(5000).frame(), &params, GroFlags::empty());
    engine.aggregate_segment(FLOW, Seg::new(5060).frame(), &params, GroFlags::empty());
    let before = engine.context(FLOW);

    for event in stale {
        engine.timeout_callback(event);
    }
    assert_eq!(engine.context(FLOW), before);
    assert!(flushed.lock().is_empty());
    assert_eq!(GroStats::read(engine.counters(), 0).timeout_flushes, 0);
    assert!(engine.timers().is_armed(before.timer().unwrap()));

    // The live timer still works.
    for event in engine.timers().advance(Duration::from_millis(10)) {
        engine.timeout_callback(event);
    }
    let flushed = flushed.lock();
    assert_eq!(flushed.len(), 1);
    assert_eq!(flushed[0].aggregate.segment_count(), 2);
}

#[test]
fn timer_is_recharged_when_the_flow_reopens() {
    let engine = engine();
    let params = params(10, 1000);
    engine.aggregate_segment(FLOW, Seg::new(1000).frame(), &params, GroFlags::empty());
    let timer = engine.context(FLOW).timer();

    assert!(engine.timers().advance(Duration::from_millis(5)).is_empty());
    let out = engine.aggregate_segment(FLOW, Seg::new(9000).frame(), &params, GroFlags::empty());
    assert_eq!(
        out.disposition,
        Disposition::FLUSH_NOW | Disposition::NEW_AGGREGATION_STARTED
    );
    assert_eq!(engine.context(FLOW).timer(), timer);

    assert!(engine.timers().advance(Duration::from_millis(6)).is_empty());
    let events = engine.timers().advance(Duration::from_millis(4));
    assert_eq!(events.len(), 1);
    for event in events {
        engine.timeout_callback(event);
    }
    assert!(!engine.context(FLOW).is_active());
}

#[test]
fn appends_do_not_extend_the_deadline() {
    let engine = engine();
    let params = params(10, 1000);
    let segs = run(1000, 3, 60);
    engine.aggregate_segment(FLOW, segs[0].frame(), &params, GroFlags::empty());
    engine.timers().advance(Duration::from_millis(6));
    engine.aggregate_segment(FLOW, segs[1].frame(), &params, GroFlags::empty());
    engine.timers().advance(Duration::from_millis(3));
    engine.aggregate_segment(FLOW, segs[2].frame(), &params, GroFlags::empty());
    assert_eq!(engine.timers().advance(Duration::from_millis(1)).len(), 1);
}

#[test]
fn flows_time_out_independently() {
    let engine = engine();
    let flushed = Arc::new(Mutex::new(Vec::new()));
    let params = collecting_params(&flushed, 0);
    engine.aggregate_segment(1, Seg::new(1).frame(), &params, GroFlags::empty());
    engine.timers().advance(Duration::from_millis(4));
    engine.aggregate_segment(2, Seg::new(1).frame(), &params, GroFlags::empty());

    for event in engine.timers().advance(Duration::from_millis(6)) {
        engine.timeout_callback(event);
    }
    assert!(!engine.context(1).is_active());
    assert!(engine.context(2).is_active());

    for event in engine.timers().advance(Duration::from_millis(4)) {
        engine.timeout_callback(event);
    }
    let order: Vec<u64> = flushed.lock().iter().map(|f| f.context_addr).collect();
    assert_eq!(order, vec![1, 2]);
}
