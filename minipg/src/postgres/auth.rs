//! MD5 password authentication.
use std::fmt::Write;

/// Build the `PasswordMessage` body for an `AuthenticationMD5Password`
/// challenge.
///
/// The scheme is `"md5" + hex(md5(hex(md5(password + user)) + salt))`, where
/// `salt` is the four bytes following the auth-type word of the challenge.
pub(crate) fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let mut inner = Vec::with_capacity(password.len() + user.len());
    inner.extend_from_slice(password.as_bytes());
    inner.extend_from_slice(user.as_bytes());
    let inner_hash = md5::compute(&inner);

    let mut outer = format!("{inner_hash:x}").into_bytes();
    outer.extend_from_slice(&salt);
    let outer_hash = md5::compute(&outer);

    let mut result = String::with_capacity(35);
    result.push_str("md5");
    write!(&mut result, "{outer_hash:x}").expect("writing to a string");
    result
}

#[cfg(test)]
mod test {
    use super::md5_password;

    #[test]
    fn md5_challenge() {
        // md5(hex(md5("postgrespostgres")) + "\x12\x34\x56\x78")
        assert_eq!(
            md5_password("postgres", "postgres", [0x12, 0x34, 0x56, 0x78]),
            "md5b400a301a6904ae12fc76a8fff168215",
        );
    }

    #[test]
    fn salt_changes_digest() {
        let a = md5_password("postgres", "postgres", [0, 0, 0, 0]);
        let b = md5_password("postgres", "postgres", [0, 0, 0, 1]);
        assert_ne!(a, b);
        assert!(a.starts_with("md5") && b.starts_with("md5"));
    }
}
