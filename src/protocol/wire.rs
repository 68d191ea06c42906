//! Generated protobuf message types (see `proto/bep.proto`, `build.rs`).

include!(concat!(env!("OUT_DIR"), "/peersync.wire.rs"));
