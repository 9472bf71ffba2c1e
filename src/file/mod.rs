//! Section-level access to PE images.
//!
//! The deobfuscation passes only need the section table and the raw bytes behind it:
//! the anti-tamper key schedule hashes section names and mixes the content of every
//! other section, and the decryptor rewrites one section in place. [`Image`] owns the
//! file bytes together with a parsed copy of the section table, so sections can be
//! borrowed mutably without re-parsing the PE structure.
//!
//! # Examples
//!
//! ```rust
//! use unconfuse::file::{Image, SectionHeader, SectionCharacteristics};
//!
//! let header = SectionHeader::new(*b".text\0\0\0", 0x2000, 0x0, 0x10)
//!     .with_characteristics(SectionCharacteristics::CNT_CODE | SectionCharacteristics::MEM_READ);
//! let image = Image::from_sections(vec![0xAA; 0x10], vec![header])?;
//!
//! assert_eq!(image.sections().len(), 1);
//! assert_eq!(image.section_data(&image.sections()[0])?, &[0xAA; 0x10]);
//! # Ok::<(), unconfuse::Error>(())
//! ```

use bitflags::bitflags;
use goblin::pe::PE;

use crate::{Error, Result};

bitflags! {
    /// Section header characteristic flags (`IMAGE_SCN_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SectionCharacteristics: u32 {
        /// The section contains executable code
        const CNT_CODE = 0x0000_0020;
        /// The section contains initialized data
        const CNT_INITIALIZED_DATA = 0x0000_0040;
        /// The section contains uninitialized data
        const CNT_UNINITIALIZED_DATA = 0x0000_0080;
        /// The section can be discarded as needed
        const MEM_DISCARDABLE = 0x0200_0000;
        /// The section can be shared in memory
        const MEM_SHARED = 0x1000_0000;
        /// The section can be executed as code
        const MEM_EXECUTE = 0x2000_0000;
        /// The section can be read
        const MEM_READ = 0x4000_0000;
        /// The section can be written to
        const MEM_WRITE = 0x8000_0000;
    }
}

impl SectionCharacteristics {
    /// Read/write/execute initialized data, the flag set anti-tamper assigns to the
    /// section holding encrypted method bodies (`0xE0000040`).
    pub const ENCRYPTED_BODIES: Self = Self::CNT_INITIALIZED_DATA
        .union(Self::MEM_EXECUTE)
        .union(Self::MEM_READ)
        .union(Self::MEM_WRITE);
}

/// Hash of an 8-byte section name: the product of its two little-endian halves.
///
/// # Examples
///
/// ```rust
/// use unconfuse::file::section_name_hash;
///
/// assert_eq!(section_name_hash(&[2, 0, 0, 0, 3, 0, 0, 0]), 6);
/// assert_eq!(section_name_hash(b".tls\0\0\0\0"), 0);
/// ```
#[must_use]
pub fn section_name_hash(name: &[u8; 8]) -> u32 {
    let (n1, n2) = section_name_words(name);
    n1.wrapping_mul(n2)
}

/// The two little-endian words of a section name.
#[must_use]
pub fn section_name_words(name: &[u8; 8]) -> (u32, u32) {
    let n1 = u32::from_le_bytes([name[0], name[1], name[2], name[3]]);
    let n2 = u32::from_le_bytes([name[4], name[5], name[6], name[7]]);
    (n1, n2)
}

/// One entry of the section table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    /// Raw, zero-padded section name
    pub name: [u8; 8],
    /// Relative virtual address of the section
    pub virtual_address: u32,
    /// Size of the section once loaded
    pub virtual_size: u32,
    /// File offset of the raw section data
    pub pointer_to_raw_data: u32,
    /// Size of the raw section data
    pub size_of_raw_data: u32,
    /// Raw characteristic flags
    pub characteristics: u32,
}

impl SectionHeader {
    /// Creates a header whose virtual size equals its raw size and without flags.
    #[must_use]
    pub fn new(
        name: [u8; 8],
        virtual_address: u32,
        pointer_to_raw_data: u32,
        size_of_raw_data: u32,
    ) -> Self {
        SectionHeader {
            name,
            virtual_address,
            virtual_size: size_of_raw_data,
            pointer_to_raw_data,
            size_of_raw_data,
            characteristics: 0,
        }
    }

    /// Returns the header with the given characteristic flags.
    #[must_use]
    pub fn with_characteristics(mut self, characteristics: SectionCharacteristics) -> Self {
        self.characteristics = characteristics.bits();
        self
    }

    /// Characteristic flags; unknown bits are dropped.
    #[must_use]
    pub fn flags(&self) -> SectionCharacteristics {
        SectionCharacteristics::from_bits_truncate(self.characteristics)
    }

    /// See [`section_name_hash`].
    #[must_use]
    pub fn name_hash(&self) -> u32 {
        section_name_hash(&self.name)
    }

    /// Name up to the first NUL, lossily decoded.
    #[must_use]
    pub fn name_str(&self) -> String {
        let end = self.name.iter().position(|b| *b == 0).unwrap_or(8);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    /// Returns true if both headers describe the same raw and virtual location.
    #[must_use]
    pub fn same_location(&self, other: &SectionHeader) -> bool {
        self.pointer_to_raw_data == other.pointer_to_raw_data
            && self.virtual_address == other.virtual_address
    }

    fn raw_range(&self) -> (usize, usize) {
        let start = self.pointer_to_raw_data as usize;
        (start, start.saturating_add(self.size_of_raw_data as usize))
    }
}

/// A PE image: owned file bytes plus the section table describing them.
#[derive(Debug, Clone, Default)]
pub struct Image {
    data: Vec<u8>,
    sections: Vec<SectionHeader>,
}

impl Image {
    /// Parses the section table of a .NET PE file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Empty`] for empty input, [`Error::GoblinErr`] if goblin rejects
    /// the PE structure and [`Error::Malformed`] if the file has no CLR runtime header
    /// or a section points outside the file.
    pub fn parse(data: Vec<u8>) -> Result<Image> {
        if data.is_empty() {
            return Err(Error::Empty);
        }

        let sections = {
            let pe = PE::parse(&data)?;
            match pe.header.optional_header {
                Some(optional_header) => {
                    if optional_header
                        .data_directories
                        .get_clr_runtime_header()
                        .is_none()
                    {
                        return Err(malformed_error!(
                            "File does not have a CLR runtime header directory"
                        ));
                    }
                }
                None => return Err(malformed_error!("File does not have an OptionalHeader")),
            }

            pe.sections
                .iter()
                .map(|section| SectionHeader {
                    name: section.name,
                    virtual_address: section.virtual_address,
                    virtual_size: section.virtual_size,
                    pointer_to_raw_data: section.pointer_to_raw_data,
                    size_of_raw_data: section.size_of_raw_data,
                    characteristics: section.characteristics,
                })
                .collect::<Vec<_>>()
        };

        Self::from_sections(data, sections)
    }

    /// Builds an image from raw bytes and an already known section table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if a section's raw data lies outside `data`.
    pub fn from_sections(data: Vec<u8>, sections: Vec<SectionHeader>) -> Result<Image> {
        for section in &sections {
            let (_, end) = section.raw_range();
            if end > data.len() {
                return Err(malformed_error!(
                    "Section '{}' raw data ends at 0x{:X}, past the file end 0x{:X}",
                    section.name_str(),
                    end,
                    data.len()
                ));
            }
        }
        Ok(Image { data, sections })
    }

    /// The section table.
    #[must_use]
    pub fn sections(&self) -> &[SectionHeader] {
        &self.sections
    }

    /// The complete file content.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the image and returns the file content.
    #[must_use]
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Raw bytes of `section`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if the section lies outside the image.
    pub fn section_data(&self, section: &SectionHeader) -> Result<&[u8]> {
        let (start, end) = section.raw_range();
        self.data.get(start..end).ok_or_else(|| {
            malformed_error!(
                "Section '{}' (0x{:X}..0x{:X}) is out of bounds",
                section.name_str(),
                start,
                end
            )
        })
    }

    /// Mutable raw bytes of `section`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if the section lies outside the image.
    pub fn section_data_mut(&mut self, section: &SectionHeader) -> Result<&mut [u8]> {
        let (start, end) = section.raw_range();
        let len = self.data.len();
        self.data.get_mut(start..end).ok_or_else(|| {
            malformed_error!(
                "Section '{}' (0x{:X}..0x{:X}) is out of bounds of 0x{:X}",
                section.name_str(),
                start,
                end,
                len
            )
        })
    }

    /// Raw data of every section except `target`, in table order, skipping sections
    /// whose name hash is zero.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if a section lies outside the image.
    pub fn auxiliary_sections(&self, target: &SectionHeader) -> Result<Vec<&[u8]>> {
        let mut result = Vec::new();
        for section in &self.sections {
            if section.same_location(target) || section.name_hash() == 0 {
                continue;
            }
            result.push(self.section_data(section)?);
        }
        Ok(result)
    }
}
