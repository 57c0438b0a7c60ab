pub mod defer;
pub mod periodic;
