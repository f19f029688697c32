//! Sonance Core - real-time audio streaming toolkit.
//!
//! This crate transports uncompressed audio across an IP network using
//! RTP-family packet protocols, with forward-error-correction seams, jitter
//! buffering and out-of-band control plumbing. A sender takes samples from
//! the application, chunks them into packets and transmits them; a receiver
//! ingests packets, reorders and repairs them, conceals losses and delivers
//! a steady frame stream back to the application.
//!
//! # Architecture
//!
//! Two loops do the heavy lifting:
//!
//! - [`pipeline::PipelineLoop`]: a threadless cooperative scheduler that
//!   interleaves hard-deadline frame processing with soft-deadline control
//!   tasks on the caller's thread, guaranteeing that task work never starves
//!   frame work.
//! - [`net::NetworkLoop`]: an event-driven transport multiplexing UDP ports
//!   and TCP connections on a single owned thread, with lock-free task
//!   submission, per-connection state machines and back-pressure-aware
//!   outbound queues.
//!
//! The loops meet through packet readers and writers, decoupled by
//! concurrent queues; the control plane runs on the
//! [`control::ControlTaskQueue`] worker thread.
//!
//! # Modules
//!
//! - [`sync`]: lock-free MPSC queue, seqlock, semaphore, timer
//! - [`pool`]: bounded frame/packet/buffer pools
//! - [`packet`]: packet objects, wrap-aware units, reorder queues
//! - [`rtp`]: RTP header codec and stream validation
//! - [`audio`]: frames, PCM codec, depacketizer, packetizer, watchdog
//! - [`fec`]: block codec seams and repair reader/writer
//! - [`pipeline`]: the cooperative pipeline loop
//! - [`control`]: the deferred-work control queue
//! - [`net`]: sockets, ports and the network event loop
//! - [`endpoint`]: endpoint URIs and the protocol registry
//! - [`session`]: per-peer receiver and sender pipelines

#![warn(clippy::all)]

pub mod audio;
pub mod control;
pub mod endpoint;
pub mod error;
pub mod fec;
pub mod net;
pub mod packet;
pub mod pipeline;
pub mod pool;
pub mod rtp;
pub mod session;
pub mod sync;
pub mod time;

// Re-export commonly used types at the crate root
pub use audio::{Frame, FrameFactory, FrameMode, FrameReader, Sample, SampleSpec};
pub use endpoint::{Endpoint, InterfaceConfig, Protocol, ProtocolMap, Slot};
pub use error::{Error, Result};
pub use net::{NetworkLoop, NetworkTask, PortHandle, TerminationMode, UdpConfig};
pub use packet::{Packet, PacketFactory, PacketPtr, PacketReader, PacketWriter};
pub use pipeline::{PipelineLoop, PipelineLoopConfig, PipelineTask};
pub use session::{
    ReceiverConfig, ReceiverSession, SenderConfig, SenderSession,
};
