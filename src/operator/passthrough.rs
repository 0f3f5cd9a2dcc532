//! §4.2 — republishes input to the output subject unchanged, giving the
//! sink a uniform consumer contract regardless of which operator is
//! configured.

use super::{OperatorOutcome, RecordTransform};

#[derive(Default)]
pub struct Passthrough;

impl RecordTransform for Passthrough {
    fn apply(&mut self, payload: &[u8]) -> OperatorOutcome {
        OperatorOutcome::Emit(bytes::Bytes::copy_from_slice(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_input_byte_for_byte() {
        let mut op = Passthrough;
        match op.apply(b"{\"a\":1}") {
            OperatorOutcome::Emit(payload) => assert_eq!(&payload[..], b"{\"a\":1}"),
            OperatorOutcome::Suppress => panic!("passthrough must never suppress"),
        }
    }
}
