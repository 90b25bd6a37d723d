//! # Edictflow Core
//!
//! Edictflow keeps a managed section of a project configuration file in line
//! with a centrally approved rule catalog:
//!
//! - **Rule lifecycle**: draft, submit, multi-party approval, reset
//! - **Effective sets**: which approved rules reach which caller, in what
//!   order, under which monotonic version
//! - **Change control**: drift reported by agents becomes change requests;
//!   enforcement modes decide between accept, revert and time-boxed pending
//! - **Render/merge**: the sentinel-delimited managed section, merged into
//!   hand-written content without touching it
//!
//! The controller server and the agent daemon are thin shells around this
//! crate; both speak the [`protocol`] envelope.
//!
//! ## Example
//!
//! ```rust
//! use chrono::Utc;
//! use edictflow_core::model::TargetLayer;
//! use edictflow_core::protocol::RuleRecord;
//! use edictflow_core::render::{is_tampered, merge_with_existing, render_managed_section};
//!
//! let rule = RuleRecord {
//!     id: "r-1".into(),
//!     name: "No secrets".into(),
//!     body: "Never commit credentials.".into(),
//!     target_layer: TargetLayer::Enterprise,
//!     triggers: vec![],
//!     enforcement_mode: Default::default(),
//!     temporary_timeout_hours: 0,
//!     priority_weight: 10,
//!     overridable: false,
//!     force: true,
//!     category_id: None,
//!     effective_start: None,
//!     effective_end: None,
//! };
//!
//! let managed = render_managed_section(&[rule], &[], Utc::now());
//! let file = merge_with_existing("# My project\n", &managed);
//!
//! assert!(file.starts_with("# My project\n\n"));
//! assert!(file.contains("[Enterprise] **No secrets**"));
//! assert!(!is_tampered(&file, &managed));
//! ```

pub mod audit;
pub mod clock;
pub mod directory;
pub mod engine;
pub mod error;
pub mod hash;
pub mod model;
pub mod protocol;
pub mod render;
pub mod storage;

pub use audit::AuditEvent;
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{Controller, ControllerBuilder, Dispatcher};
pub use error::{EdictError, ErrorCategory, ErrorDetail, ErrorResponse, Result};
pub use hash::content_hash;
pub use protocol::{Envelope, Message, MessageType};

/// Protocol version spoken by this build
pub const PROTOCOL_VERSION: &str = "1.0";
