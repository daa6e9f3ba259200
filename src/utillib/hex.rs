fn unchecked_lc_encode_hex_digit(b: u8) -> u8 {
    if b < 10 {
        b + b'0'
    } else {
        b - 10 + b'a'
    }
}

pub fn encode_hex(input: &[u8], output: &mut Vec<u8>) {
    for b in input {
        output.push(unchecked_lc_encode_hex_digit(b >> 4));
        output.push(unchecked_lc_encode_hex_digit(b & 15));
    }
}

pub fn to_hex_string(input: &[u8]) -> String {
    let mut out = Vec::with_capacity(input.len() * 2);
    encode_hex(input, &mut out);
    String::from_utf8(out).expect("producing valid ascii")
}

#[test]
fn t_encode_hex() {
    let t = to_hex_string;
    assert_eq!(t(b"Hello\0"), "48656c6c6f00");
    assert_eq!(t(&[9, 10, 11, 15, 16, 254, 255, 0]), "090a0b0f10feff00");
}
