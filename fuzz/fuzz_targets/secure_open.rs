#![no_main]

use keyble_core::SessionState;
use keyble_proto::MessageKind;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary ciphertext against a live session: opening must fail
    // cleanly (bad counter, bad auth, truncation) and never panic.
    let mut session = SessionState::new(1, [0x42; 16]);
    session.transport_connected();
    let mut rng = FixedRng(0x5A);
    let _ = session.begin_nonce_exchange(&mut rng);
    session.apply_connection_info(1, [0xA5; 8]);

    for kind in [MessageKind::StatusInfo, MessageKind::AnswerWithSecurity, MessageKind::UserInfo] {
        let _ = session.open_message(kind, data);
    }
});

struct FixedRng(u8);

impl rand::RngCore for FixedRng {
    fn next_u32(&mut self) -> u32 {
        u32::from(self.0) * 0x0101_0101
    }

    fn next_u64(&mut self) -> u64 {
        (u64::from(self.next_u32()) << 32) | u64::from(self.next_u32())
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        dest.fill(self.0);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}
