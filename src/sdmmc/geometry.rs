use crate::block_device::BLOCK_SIZE;
use crate::sdmmc_proto::Csd;

use super::Error;

/// The size and shape of a card, fixed once it has been initialised.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Geometry {
    sector_count: u32,
}

impl Geometry {
    /// Every card is driven with 512 byte sectors.
    pub const SECTOR_SIZE: u32 = BLOCK_SIZE as u32;

    /// A card of `sector_count` sectors.
    pub fn new(sector_count: u32) -> Geometry {
        Geometry { sector_count }
    }

    /// Work out the geometry from a raw CSD register.
    pub fn from_register(data: [u8; 16]) -> Result<Geometry, Error> {
        Csd::from_bytes(data)
            .map(|csd| Geometry::from_csd(&csd))
            .ok_or(Error::UnsupportedCsd)
    }

    /// Work out the geometry from a decoded CSD register.
    pub fn from_csd(csd: &Csd) -> Geometry {
        Geometry::new(csd.sector_count())
    }

    /// Number of sectors on the card.
    pub fn sector_count(&self) -> u32 {
        self.sector_count
    }

    /// Size of a sector in bytes.
    pub fn sector_size(&self) -> u32 {
        Self::SECTOR_SIZE
    }

    /// Usable size of the card in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        u64::from(self.sector_count) * u64::from(Self::SECTOR_SIZE)
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
