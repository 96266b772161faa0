//! SwingSet kernel core.
//!
//! Vats are isolated units of computation that only talk to each other through the
//! kernel, by sending messages to objects and promises. The kernel owns the tables that
//! translate each vat's local references, routes messages, settles promises, collects
//! objects nobody references any more, and records every delivery in a per-vat transcript
//! so a vat worker can be rebuilt by replay. Each unit of work (a crank) commits to the
//! store as a single batch.

pub mod config;
pub mod error;
pub mod gc;
mod kernel;
pub mod message;
pub mod refs;
pub mod replay;
pub mod scheduler;
pub mod state;
mod syscall;
mod translate;
pub mod vat;

pub use config::KernelConfig;
pub use error::{KernelError, KernelResult, SyscallError};
pub use gc::{GcAction, GcActionKind};
pub use kernel::{Kernel, open_kernel};
pub use message::{CapData, KernelCapData, KernelMessage, Message, VatCapData, VatMessage};
pub use refs::{Durability, KernelRef, VatId, VatRef};
pub use scheduler::{
    ComputronBudget, CrankBudget, CrankKind, CrankPhase, CrankReport, RunPolicy, RunUntilIdle,
};
pub use state::{KernelState, PromiseState, PromiseStatus, VatInfo, VatOptions};
pub use vat::{
    DeliveryOutcome, SyscallHandler, VatDelivery, VatManager, VatManagerError, VatResolution,
    VatSyscall, VatSyscallResult,
};
