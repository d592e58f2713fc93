pub(crate) mod accounting;
pub(crate) mod config;
pub(crate) mod lifecycle;
pub(crate) mod protocol;
pub(crate) mod resolver;
pub(crate) mod server;
pub(crate) mod upstream;

#[cfg(test)]
pub(crate) mod testing;
