/// Holds the raw secret material for the security envelope. This is the
/// only place in the workspace allowed to hold the bytes directly; every
/// other component receives a `&Keyring` borrow.
#[derive(Clone)]
pub struct Keyring {
    hmac_key: [u8; 32],
    aes: Option<AesMaterial>,
}

#[derive(Clone)]
struct AesMaterial {
    key: [u8; 16],
    iv: [u8; 16],
}

impl Keyring {
    /// Builds a keyring with encryption disabled (base64-only payload framing).
    pub fn new(hmac_key: [u8; 32]) -> Self {
        Self { hmac_key, aes: None }
    }

    /// Builds a keyring with AES-128-CBC + PKCS7 encryption enabled.
    pub fn with_encryption(hmac_key: [u8; 32], aes_key: [u8; 16], iv: [u8; 16]) -> Self {
        Self {
            hmac_key,
            aes: Some(AesMaterial { key: aes_key, iv }),
        }
    }

    pub fn hmac_key(&self) -> &[u8; 32] {
        &self.hmac_key
    }

    pub fn aes_key(&self) -> Option<&[u8; 16]> {
        self.aes.as_ref().map(|a| &a.key)
    }

    pub fn iv(&self) -> Option<&[u8; 16]> {
        self.aes.as_ref().map(|a| &a.iv)
    }

    pub fn encrypted(&self) -> bool {
        self.aes.is_some()
    }
}
