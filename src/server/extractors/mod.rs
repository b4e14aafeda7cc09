mod token_extractor;

pub use token_extractor::*;
