//! Reelforge-Common: shared types for the reelforge workspace.
//!
//! - **Session identifiers**: [`SessionId`], the validated client file name
//!   that keys an upload session and names its merged artifact.
//! - **Error handling**: the [`Error`] taxonomy shared by the upload engine,
//!   the range streamer and the HTTP layer, plus the [`Result`] alias.
//!
//! # Examples
//!
//! ```
//! use reelforge_common::{Error, SessionId};
//!
//! let id = SessionId::parse("clip.mov").unwrap();
//! assert_eq!(id.extension().as_deref(), Some("mov"));
//!
//! let err = SessionId::parse("../clip.mov").unwrap_err();
//! assert!(matches!(err, Error::InvalidArgument(_)));
//! ```

pub mod error;
pub mod ids;

pub use error::{Error, Result};
pub use ids::*;
