pub mod config;
pub mod controller;
pub mod identity;
pub mod key_material;
pub mod labels;
pub mod secret_store;
pub mod signing_authority;
pub mod trust_roots;
pub mod utils;
pub mod validator;

#[cfg(test)]
mod test_util;
