//! Canonical event types for the watchtower filesystem-observation engine.
//!
//! This crate has no knowledge of any particular kernel notification mechanism; it only
//! defines the shape that every backend translates its raw notifications into.

pub mod event;

pub use event::{
    AccessKind, AccessMode, CreateKind, DataChange, Event, EventAttributes, EventKind,
    EventKindMask, Flag, MetadataKind, ModifyKind, RemoveKind, RenameMode,
};
