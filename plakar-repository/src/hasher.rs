//! Repository MAC computation.
//!
//! With encryption enabled every MAC is an HMAC-SHA-256 under the master
//! key, making addresses unforgeable without the key; otherwise a plain
//! SHA-256 digest is used.

use anyhow::Error;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Signer;

use plakar_types::Mac;

#[derive(Clone)]
pub enum MacHasher {
    Plain,
    Keyed([u8; 32]),
}

impl MacHasher {
    pub fn plain() -> Self {
        MacHasher::Plain
    }

    pub fn keyed(key: [u8; 32]) -> Self {
        MacHasher::Keyed(key)
    }

    pub fn mac(&self, data: &[u8]) -> Mac {
        let mut stream = self.streaming();
        stream.update(data);
        stream.finalize()
    }

    pub fn streaming(&self) -> MacStream {
        match self {
            MacHasher::Plain => MacStream::Plain(openssl::sha::Sha256::new()),
            MacHasher::Keyed(key) => MacStream::Keyed(KeyedStream::new(key)),
        }
    }
}

pub enum MacStream {
    Plain(openssl::sha::Sha256),
    Keyed(KeyedStream),
}

impl MacStream {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            MacStream::Plain(sha) => sha.update(data),
            MacStream::Keyed(hmac) => hmac.update(data),
        }
    }

    pub fn finalize(self) -> Mac {
        match self {
            MacStream::Plain(sha) => Mac::new(sha.finish()),
            MacStream::Keyed(hmac) => hmac.finalize(),
        }
    }
}

/// HMAC-SHA-256 accumulator; buffers are fed straight into openssl.
pub struct KeyedStream {
    pkey: PKey<openssl::pkey::Private>,
    buffer: Vec<u8>,
}

impl KeyedStream {
    fn new(key: &[u8; 32]) -> Self {
        // cannot fail for HMAC keys of this size
        let pkey = PKey::hmac(key).expect("HMAC key setup");
        Self {
            pkey,
            buffer: Vec::new(),
        }
    }

    fn update(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    fn finalize(self) -> Mac {
        let mac = (|| -> Result<Mac, Error> {
            let mut signer = Signer::new(MessageDigest::sha256(), &self.pkey)?;
            signer.update(&self.buffer)?;
            let mut tag = [0u8; 32];
            signer.sign(&mut tag)?;
            Ok(Mac::new(tag))
        })();
        mac.expect("HMAC computation")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain_matches_sha256() {
        let hasher = MacHasher::plain();
        let mac = hasher.mac(b"hello dummy");
        assert_eq!(mac.0, openssl::sha::sha256(b"hello dummy"));
    }

    #[test]
    fn keyed_differs_per_key() {
        let a = MacHasher::keyed([1u8; 32]).mac(b"data");
        let b = MacHasher::keyed([2u8; 32]).mac(b"data");
        let c = MacHasher::keyed([1u8; 32]).mac(b"data");
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn streaming_equals_one_shot() {
        let hasher = MacHasher::keyed([9u8; 32]);
        let mut stream = hasher.streaming();
        stream.update(b"hello ");
        stream.update(b"world");
        assert_eq!(stream.finalize(), hasher.mac(b"hello world"));
    }
}
