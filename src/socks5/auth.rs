use crate::socks5::protocol::AuthMethod;

/// select_auth_method takes the auth methods offered by the socks client
/// and returns the method the server will use, or NoAcceptable
pub fn select_auth_method(client_methods: &[u8]) -> AuthMethod {
    // Preferred auth method order
    // GSSAPI and username/password are recognised on the wire but never chosen
    const PREFERRED_METHODS: &[AuthMethod] = &[AuthMethod::NoAuth];

    // Iterate through preferences in order. If there's a match
    // return it
    for &preferred in PREFERRED_METHODS {
        if client_methods.contains(&(preferred as u8)) {
            return preferred;
        }
    }

    AuthMethod::NoAcceptable
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_no_auth_when_offered() {
        assert_eq!(select_auth_method(&[0x02, 0x00]), AuthMethod::NoAuth);
        assert_eq!(select_auth_method(&[0x00]), AuthMethod::NoAuth);
    }

    #[test]
    fn rejects_offers_without_no_auth() {
        assert_eq!(select_auth_method(&[]), AuthMethod::NoAcceptable);
        assert_eq!(
            select_auth_method(&[AuthMethod::Gssapi as u8, AuthMethod::UserPass as u8]),
            AuthMethod::NoAcceptable
        );
    }
}
