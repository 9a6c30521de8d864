#![no_main]

use keyble_proto::fragment::FRAGMENT_LEN;
use keyble_proto::{Fragment, Reassembler};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Feed an arbitrary fragment stream; reassembly must never panic and
    // must recover from desynchronization.
    let mut reassembler = Reassembler::new();
    for chunk in data.chunks_exact(FRAGMENT_LEN) {
        let mut bytes = [0u8; FRAGMENT_LEN];
        bytes.copy_from_slice(chunk);
        let _ = reassembler.push(Fragment::from_bytes(bytes));
    }
});
