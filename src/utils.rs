/// Renders `bytes` as a classic 16-per-line hexdump, labelling the first
/// byte with address `start`.
pub fn hexdump(bytes: &[u8], start: u32) -> String {
    let mut str = String::new();
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let addr = start as u64 + row as u64 * 16;
        let mut line = format!("{:04x}: ", addr);
        let mut chars = String::new();
        for byte in chunk {
            line.push_str(&format!("{:02x} ", byte));
            let c = *byte as char;
            chars.push(if c.is_ascii_graphic() || c == ' ' {
                c
            } else {
                '.'
            });
        }

        let dump_line = format!("{:<54} {}\n", line, chars);
        str.push_str(&dump_line);
    }

    str
}
