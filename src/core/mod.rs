//! Source side: Ruby recipe lexing, value parsing, declaration extraction
//! and cookbook loading.

pub mod cookbook;
pub mod extractor;
pub mod lexer;
pub mod types;
pub mod values;
