#[cfg(test)]
pub mod test_support;
pub mod url;
