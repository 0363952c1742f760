//! Content-defined chunking.
//!
//! Thin wrapper over the FastCDC streaming splitter, honouring the
//! repository's configured (min, avg, max) sizes. Identical content under
//! the same key always yields identical chunk MACs; this is the dedup
//! primitive.

use std::io::Read;

use anyhow::{bail, format_err, Error};
use fastcdc::v2020::StreamCDC;

use plakar_types::config::ChunkingConfig;

pub fn validate(config: &ChunkingConfig) -> Result<(), Error> {
    if config.algorithm != "fastcdc" {
        bail!("unsupported chunking algorithm '{}'", config.algorithm);
    }
    if config.min_size == 0
        || config.min_size > config.avg_size
        || config.avg_size > config.max_size
    {
        bail!(
            "invalid chunking sizes ({}/{}/{})",
            config.min_size,
            config.avg_size,
            config.max_size
        );
    }
    Ok(())
}

/// Split `reader` into content-defined chunks.
pub fn stream<'a, R: Read + 'a>(
    config: &ChunkingConfig,
    reader: R,
) -> impl Iterator<Item = Result<Vec<u8>, Error>> + 'a {
    StreamCDC::new(reader, config.min_size, config.avg_size, config.max_size).map(|item| {
        item.map(|chunk| chunk.data)
            .map_err(|err| format_err!("chunker failed - {}", err))
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn small_config() -> ChunkingConfig {
        ChunkingConfig {
            algorithm: "fastcdc".to_string(),
            min_size: 64,
            avg_size: 256,
            max_size: 1024,
        }
    }

    #[test]
    fn chunks_reassemble_to_input() {
        let data: Vec<u8> = (0..32 * 1024).map(|i| (i * 7 % 251) as u8).collect();
        let chunks: Vec<Vec<u8>> = stream(&small_config(), &data[..])
            .collect::<Result<_, _>>()
            .unwrap();

        assert!(chunks.len() > 1);
        let reassembled: Vec<u8> = chunks.concat();
        assert_eq!(reassembled, data);
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(chunk.len() >= 64 && chunk.len() <= 1024);
        }
    }

    #[test]
    fn chunking_is_deterministic() {
        let data: Vec<u8> = (0..16 * 1024).map(|i| (i * 13 % 241) as u8).collect();
        let first: Vec<Vec<u8>> = stream(&small_config(), &data[..])
            .collect::<Result<_, _>>()
            .unwrap();
        let second: Vec<Vec<u8>> = stream(&small_config(), &data[..])
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_bad_configuration() {
        let mut config = small_config();
        config.min_size = 2048;
        assert!(validate(&config).is_err());
        config = small_config();
        config.algorithm = "buzhash".into();
        assert!(validate(&config).is_err());
    }
}
