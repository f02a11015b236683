//! Cross-crate integration scenarios for earguard

#[cfg(test)]
mod enforcement_integration;
