//! System requirements validation.
//!
//! This module provides functions to check that the process has what it
//! needs to mount, chroot and switch users before any command runs.

mod requirements;

pub use requirements::{SystemRequirements, check_all, check_mountinfo, check_privileges};
