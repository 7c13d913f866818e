//! Bencode encoding and decoding ([BEP-3]).
//!
//! Every DHT datagram is a single bencoded dictionary. Dictionaries in this module keep their
//! keys in insertion order, so a dictionary that is decoded and re-encoded yields the same bytes,
//! and outgoing messages are encoded exactly in the order they were built.
//!
//! | Type | Format | Example |
//! |------|--------|---------|
//! | Integer | `i<number>e` | `i42e` |
//! | Byte string | `<length>:<data>` | `4:spam` |
//! | List | `l<items>e` | `l4:spami42ee` |
//! | Dictionary | `d<key><value>...e` | `d3:foo3:bare` |
//!
//! Decoding failures carry the byte offset at which the problem was detected and are classified
//! either as [`ErrorKind::Invalid`] (the input is not bencode) or [`ErrorKind::Unsupported`] (the
//! input is plausible bencode but exceeds the limits this decoder accepts).
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

mod decode;
mod encode;
mod error;
mod value;

pub use self::{
    decode::{decode, decode_dictionary},
    encode::encode,
    error::{Error, ErrorKind},
    value::{Dictionary, DictionaryBuilder, Value},
};
