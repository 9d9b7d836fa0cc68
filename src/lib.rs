#![warn(clippy::todo, clippy::missing_const_for_fn, clippy::pedantic)]
#![expect(clippy::cast_possible_truncation, clippy::must_use_candidate)]
#![allow(
    clippy::doc_markdown,
    clippy::cast_possible_wrap,
    clippy::too_many_lines,
    clippy::module_name_repetitions
)]

pub mod ethercat;
pub mod osal;
pub mod oshw;
