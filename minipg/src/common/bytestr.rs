use std::str::Utf8Error;

use bytes::Bytes;

/// An immutable UTF-8 string view over [`Bytes`].
///
/// Protocol strings are sliced out of the receive buffer; keeping them as
/// `Bytes` makes the slice reference-counted instead of forcing the `Vec`
/// round trip of `String::from_utf8`.
#[derive(Clone)]
pub struct ByteStr(Bytes);

impl ByteStr {
    /// Validate `bytes` as UTF-8 and wrap them, without copying.
    pub fn from_utf8(bytes: Bytes) -> Result<Self, Utf8Error> {
        std::str::from_utf8(&bytes)?;
        Ok(Self(bytes))
    }

    /// Wrap a static string, without allocating.
    pub const fn from_static(value: &'static str) -> Self {
        Self(Bytes::from_static(value.as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        // SAFETY: every constructor verified the bytes are UTF-8
        unsafe { std::str::from_utf8_unchecked(&self.0) }
    }
}

impl std::ops::Deref for ByteStr {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl From<&'static str> for ByteStr {
    fn from(value: &'static str) -> Self {
        Self::from_static(value)
    }
}

impl From<String> for ByteStr {
    fn from(value: String) -> Self {
        Self(Bytes::from(value.into_bytes()))
    }
}

impl std::fmt::Display for ByteStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for ByteStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self.as_str(), f)
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::ByteStr;

    #[test]
    fn utf8_is_enforced() {
        let ok = ByteStr::from_utf8(Bytes::from_static("héllo".as_bytes())).unwrap();
        assert_eq!(ok.as_str(), "héllo");

        ByteStr::from_utf8(Bytes::from_static(&[0xFF, 0xFE])).unwrap_err();
    }

    #[test]
    fn derefs_to_str() {
        let name = ByteStr::from_static("client_encoding");
        assert!(name.starts_with("client_"));
        assert_eq!(format!("{name}"), "client_encoding");
        assert_eq!(format!("{name:?}"), "\"client_encoding\"");
    }
}
