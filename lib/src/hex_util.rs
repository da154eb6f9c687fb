// Copyright 2024 The Arbor Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Helpers for converting identifiers between bytes and hex strings.

/// Encodes `data` as a lowercase hex string.
pub fn encode_hex(data: &[u8]) -> String {
    hex::encode(data)
}

/// Decodes the given hex string to bytes. Returns `None` if the input wasn't
/// valid hex.
pub fn decode_hex(hex: impl AsRef<[u8]>) -> Option<Vec<u8>> {
    hex::decode(hex).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        assert_eq!(encode_hex(b"\x12\xab"), "12ab");
        assert_eq!(decode_hex("12ab"), Some(b"\x12\xab".to_vec()));
        assert_eq!(decode_hex(""), Some(vec![]));
    }

    #[test]
    fn test_decode_invalid() {
        assert_eq!(decode_hex("0x12"), None);
        assert_eq!(decode_hex("abc"), None);
        assert_eq!(decode_hex("zz"), None);
    }
}
