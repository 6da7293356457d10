pub mod http;
pub mod subsystems;

#[cfg(test)]
mod test_support;
