#![cfg_attr(docsrs, feature(doc_cfg))]

/*!
# gro-rs: TCP Generic Receive Offload

A per-packet TCP receive aggregation engine for software data planes. Segments
of one TCP flow are coalesced into fewer, larger frames while keeping the
combined stream byte-exact on the wire: IP length fields, the IPv4 header
checksum and the TCP trailer fields are rewritten, and the TCP checksum is
either completed or left as a pseudo-header sum for a checksum offload
consumer.

## Features

- **Per-flow state machine**: start, extend, close-and-reopen and flush,
  driven by sequence continuity, ECN and timestamp equality, ACK progress,
  PSH, and size/segment-count limits
- **Timeouts**: one-shot timers per flow, with stale-event detection so a
  timer racing a close never touches the next aggregation
- **Graceful exhaustion**: buffer or timer exhaustion degrades to a
  synchronous flush or a counted discard, never an error
- **Link types**: raw IP (TUN style) and Ethernet II with up to two VLAN tags
- **Offload descriptors**: finalized aggregates describe themselves as a
  [`VirtioNetHdr`] for GSO-capable consumers
- **Async timer driver**: optional tokio integration (`async` feature)

## Quick Start

```
use gro_rs::{AggregationParams, Disposition, Frame, GroEngine, GroFlags};

let engine: GroEngine = GroEngine::default();
let params = AggregationParams::builder()
    .seg_num_limit(16)
    .packet_size_limit(9000)
    .build()?;

# let packets: Vec<Vec<u8>> = Vec::new();
for pkt in packets {
    let out = engine.aggregate_segment(0x1000, Frame::ip(&pkt[..]), &params, GroFlags::empty());
    if out.disposition.contains(Disposition::BAD_FRAME) {
        continue;
    }
    for frame in out.frames() {
        println!("emit {} bytes", frame.len());
    }
}
// Connection teardown: emit whatever is still pending.
if let Some(aggregate) = engine.flush_aggregation(0x1000).aggregate {
    println!("emit {} bytes", aggregate.len());
}
# Ok::<(), std::io::Error>(())
```

## Services

The engine is generic over the services it needs; the crate ships in-memory
implementations of each:

| Trait              | Implementation     | Purpose                                 |
|--------------------|--------------------|-----------------------------------------|
| [`FrameTransport`] | [`FramePool`]      | frame storage and concatenation         |
| [`TimerService`]   | [`DeadlineTimers`] | one-shot per-flow timers                |
| [`CounterEngine`]  | [`CounterBank`]    | saturating statistics counters          |
| [`MetadataSink`]   | [`MetadataMemory`] | per-aggregation segment count and sizes |

Per-flow state lives in a [`ContextStore`], which serializes every entry
point for the same context address.

## Timers

[`DeadlineTimers`] never fires on its own. Either advance it by hand and feed
the expired events back:

```
use gro_rs::GroEngine;
use std::time::Duration;

let engine: GroEngine = GroEngine::default();
for event in engine.timers().advance(Duration::from_millis(10)) {
    engine.timeout_callback(event);
}
```

or, with the `async` feature, let [`spawn_timer_driver`] do it on a tokio task.

## Error Handling

The aggregation entry points return a [`Disposition`] rather than an error.
Configuration and the collaborator services report [`GroError`], which
converts into `std::io::Error`.
*/

pub use crate::builder::*;
pub use crate::error::GroError;
pub use crate::offload::*;
pub use crate::platform::*;
pub use crate::virtio::*;

#[cfg_attr(docsrs, doc(cfg(feature = "async_tokio")))]
#[cfg(feature = "async_tokio")]
mod async_timer;

#[cfg_attr(docsrs, doc(cfg(feature = "async_tokio")))]
#[cfg(feature = "async_tokio")]
pub use async_timer::spawn_timer_driver;

mod builder;
pub mod checksum;
mod error;
mod offload;
pub mod parse;
mod platform;
mod virtio;
