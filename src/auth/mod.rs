mod claims;
mod jwt;
mod validator;

pub use claims::Claims;
pub use jwt::JwtValidator;
pub use validator::{Identity, TokenValidator};
