//! CRC implementations used by the .xz container.
//!
//! - **CRC-32 (ISO 3309)**: Stream Header/Footer, Block Header and Index
//!   integrity, and the 4-byte Block check.
//! - **CRC-64/ECMA-182**: the 8-byte Block check.
//!
//! Both use a const-generated 256-entry lookup table processed one byte at
//! a time. The streaming structs can be fed incrementally; the `compute`
//! shortcuts hash a whole slice.

/// CRC-32 lookup table (polynomial 0xEDB88320, reflected).
const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0usize;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// CRC-64 lookup table (polynomial 0xC96C5795D7870F42, reflected).
const CRC64_TABLE: [u64; 256] = {
    let mut table = [0u64; 256];
    let mut i = 0usize;
    while i < 256 {
        let mut crc = i as u64;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xC96C_5795_D787_0F42;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// Streaming CRC-32 calculator.
#[derive(Debug, Clone)]
pub struct Crc32 {
    state: u32,
}

impl Crc32 {
    /// Create a new CRC-32 calculator.
    pub fn new() -> Self {
        Self { state: 0xFFFF_FFFF }
    }

    /// Feed data into the calculator.
    pub fn update(&mut self, data: &[u8]) {
        let mut crc = self.state;
        for &byte in data {
            crc = (crc >> 8) ^ CRC32_TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize];
        }
        self.state = crc;
    }

    /// Finish and return the CRC value.
    pub fn finalize(&self) -> u32 {
        self.state ^ 0xFFFF_FFFF
    }

    /// Compute the CRC-32 of a whole slice.
    pub fn compute(data: &[u8]) -> u32 {
        let mut crc = Self::new();
        crc.update(data);
        crc.finalize()
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

/// Streaming CRC-64 calculator.
#[derive(Debug, Clone)]
pub struct Crc64 {
    state: u64,
}

impl Crc64 {
    /// Create a new CRC-64 calculator.
    pub fn new() -> Self {
        Self {
            state: 0xFFFF_FFFF_FFFF_FFFF,
        }
    }

    /// Feed data into the calculator.
    pub fn update(&mut self, data: &[u8]) {
        let mut crc = self.state;
        for &byte in data {
            crc = (crc >> 8) ^ CRC64_TABLE[((crc ^ u64::from(byte)) & 0xFF) as usize];
        }
        self.state = crc;
    }

    /// Finish and return the CRC value.
    pub fn finalize(&self) -> u64 {
        self.state ^ 0xFFFF_FFFF_FFFF_FFFF
    }

    /// Compute the CRC-64 of a whole slice.
    pub fn compute(data: &[u8]) -> u64 {
        let mut crc = Self::new();
        crc.update(data);
        crc.finalize()
    }
}

impl Default for Crc64 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_known_vectors() {
        assert_eq!(Crc32::compute(b""), 0);
        assert_eq!(Crc32::compute(b"123456789"), 0xCBF4_3926);
        // The Stream Flags bytes of a CRC32-check stream.
        assert_eq!(Crc32::compute(&[0x00, 0x01]), 0x36DE_2269);
        // An empty Index: indicator, zero count, two padding bytes.
        assert_eq!(Crc32::compute(&[0x00, 0x00, 0x00, 0x00]), 0x2144_DF1C);
    }

    #[test]
    fn test_crc64_known_vectors() {
        assert_eq!(Crc64::compute(b""), 0);
        assert_eq!(Crc64::compute(b"123456789"), 0x995D_C9BB_DF19_39FA);
    }

    #[test]
    fn test_streaming_matches_oneshot() {
        let data: Vec<u8> = (0u16..512).map(|i| (i % 251) as u8).collect();

        for split in [0, 1, 7, 255, 511, 512] {
            let mut crc32 = Crc32::new();
            crc32.update(&data[..split]);
            crc32.update(&data[split..]);
            assert_eq!(crc32.finalize(), Crc32::compute(&data));

            let mut crc64 = Crc64::new();
            crc64.update(&data[..split]);
            crc64.update(&data[split..]);
            assert_eq!(crc64.finalize(), Crc64::compute(&data));
        }
    }
}
