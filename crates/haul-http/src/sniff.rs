use tracing::{event, Level};

/// Leading body bytes needed to recognize a file type.
pub const SNIFF_LEN: usize = 4;

/// Extension used when the leading bytes match no known signature.
pub const UNKNOWN_EXTENSION: &str = ".xxx";

const SIGNATURES: &[(&str, [u8; SNIFF_LEN])] = &[
    // GIF87a and GIF89a
    (".gif", *b"GIF8"),
    // JFIF
    (".jpg", [0xff, 0xd8, 0xff, 0xe0]),
    // EXIF
    (".jpg", [0xff, 0xd8, 0xff, 0xe1]),
    // Adobe
    (".jpg", [0xff, 0xd8, 0xff, 0xee]),
    (".png", [0x89, b'P', b'N', b'G']),
    (".tif", [b'M', b'M', 0, 42]),
    (".tif", [b'I', b'I', 42, 0]),
];

/// Image extension for a body starting with `head`, if its signature is known.
pub fn image_extension(head: &[u8]) -> Option<&'static str> {
    let head = head.get(..SNIFF_LEN)?;

    SIGNATURES
        .iter()
        .find(|(_, signature)| head == signature)
        .map(|(extension, _)| *extension)
}

/// Like `image_extension`, falling back to `UNKNOWN_EXTENSION`.
pub fn sniff_extension(head: &[u8]) -> &'static str {
    match image_extension(head) {
        Some(extension) => extension,
        None => {
            event!(Level::WARN, head = ?&head[..head.len().min(SNIFF_LEN)], "unknown file type");
            UNKNOWN_EXTENSION
        }
    }
}
