use std::path::Path;

use voxel_engine::texture::{DecodedImage, FileDecoder, ImageDecoder};
use voxel_engine::RenderResult;

const TILE: u32 = 16;

/// Reads textures from disk and generates a grass tile for missing files
#[derive(Debug, Clone, Copy, Default)]
pub struct GrassDecoder;

impl ImageDecoder for GrassDecoder {
    fn decode(&self, path: &Path) -> RenderResult<DecodedImage> {
        if path.exists() {
            return FileDecoder.decode(path);
        }
        log::info!("{} not found, generating a grass tile", path.display());
        Ok(grass_tile())
    }
}

/// Speckled green tile, darker towards the bottom edge
pub fn grass_tile() -> DecodedImage {
    let mut pixels = Vec::with_capacity((TILE * TILE * 4) as usize);
    for y in 0..TILE {
        for x in 0..TILE {
            let noise = (x.wrapping_mul(73) ^ y.wrapping_mul(151)) % 32;
            let shade = 200 - (y * 4) as u8 - noise as u8;
            pixels.extend_from_slice(&[shade / 3, shade, shade / 4, 255]);
        }
    }
    DecodedImage {
        width: TILE,
        height: TILE,
        channels: 4,
        pixels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_generates_tile() {
        let image = GrassDecoder.decode(Path::new("no/such/grass.png")).unwrap();
        assert_eq!((image.width, image.height, image.channels), (TILE, TILE, 4));
        assert_eq!(image.pixels.len(), (TILE * TILE * 4) as usize);
        assert!(image.pixels.chunks(4).all(|p| p[3] == 255 && p[1] > p[0]));
    }
}
