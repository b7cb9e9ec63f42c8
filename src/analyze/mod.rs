// src/analyze/mod.rs
//! Analysis step: aggregate in, report text and embedding out.

pub mod ai_adapter;

pub use crate::analyze::ai_adapter::{
    build_analyzer, Analysis, DisabledAnalyzer, DynAnalyzer, MockAnalyzer, OpenAiAnalyzer,
    ReportAnalyzer,
};
