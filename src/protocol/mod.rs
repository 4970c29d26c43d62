//! Wire protocol codecs, one submodule per supported protocol.

pub mod postgres;
