use md5::{Digest, Md5};

use crate::utillib::hex::to_hex_string;

/// MD5 hash sum of `data` as lower-case hex string.
pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    let result = hasher.finalize();
    let bytes: &[u8] = result.as_ref();
    to_hex_string(bytes)
}

#[test]
fn t_md5_hex() {
    assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
    assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
}
