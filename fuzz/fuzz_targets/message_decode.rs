#![no_main]

use keyble_proto::{Message, MessageKind};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Decoding must never panic or index out of bounds on any input.
    let Some((&id, payload)) = data.split_first() else { return };
    if let Ok(kind) = MessageKind::from_id(id) {
        let _ = Message::decode(kind, payload);
    }
});
