mod errors;
mod link;

pub use errors::LinkError;
pub use link::{
    Inbound, LetterReader, LetterWriter, Link, LinkConfig, LinkContext, LinkEvent, LinkRole,
    LinkState, recv_letter, split,
};
