mod exchange;
mod token_cache;

pub use exchange::{AuthExchange, HttpAuthExchange, IssuedToken};
pub use token_cache::{TOKEN_KEY_PREFIX, TokenCache};
