pub mod leg;
pub mod protocol;
