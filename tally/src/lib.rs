//! The tally usage accumulation and charging engine.
//!
//! Metered usage is accumulated per reducer key into rolling windows at five
//! time resolutions, rated against pricing plans, and charged against rating
//! plans with the charges rolled up a report tree. This library supports the
//! tally binary found elsewhere in this project.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod accumulator;
pub mod charger;
pub mod config;
pub mod ledger;
pub mod plan;
pub mod rating;
pub mod report;
pub mod summarizer;
pub mod usage;
