//! Distributed hierarchical job execution over a tree overlay.
//!
//! Every rank of a fixed tree runs the same engine, which cooperatively
//! launches, monitors, synchronizes, and terminates parallel jobs with its
//! parent and children.
//!
//! ## Architecture modules
//!
//! - **`engine`**: the per-rank execution context. One actor task owns the
//!   peer table, the batched hello responder, the job table, and the
//!   action/notify registry that services plug their handlers into.
//! - **`idset`** / **`topology`**: compact rank sets with the canonical
//!   range-list wire encoding, and the static overlay tree with
//!   precomputed subtree sets.
//! - **`shell`**: the subprocess collaborator seam. The engine asks a
//!   `Spawner` for job shells and reacts to their events; the barrier
//!   protocol rides on the shell's stdio.
//! - **`uplink`**: a rank's contract with its parent (hello stream plus
//!   upstream notifies), implemented over gRPC or in-process channels.
//! - **`grpc`**: the Overlay (rank-to-parent) and Exec (client-facing)
//!   services and the gRPC-backed uplink.

pub mod config;
pub mod engine;
pub mod error;
pub mod grpc;
pub mod idset;
pub mod node;
pub mod shell;
pub mod shutdown;
pub mod topology;
pub mod uplink;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("canopy");
}
