//! The seam to the debug-symbol provider.
//!
//! Parsing debug databases is somebody else's job: the engine only asks for tables.

use anyhow::Result;
use std::path::Path;
use tracing::debug;

use crate::compiland::{CompilandDb, LinkerDb};
use crate::symbol::{ContributionDb, ImageSectionDb, SymbolDb, ThunkDb};

/// Produces the databases describing a linked image.
pub trait SymbolProvider: Send + Sync {
    fn symbols(&self, image: &Path) -> Result<SymbolDb>;
    fn contributions(&self, image: &Path) -> Result<ContributionDb>;
    fn compilands(&self, image: &Path) -> Result<CompilandDb>;
    fn thunks(&self, image: &Path) -> Result<ThunkDb>;
    fn image_sections(&self, image: &Path) -> Result<ImageSectionDb>;
    fn linker(&self, image: &Path) -> Result<LinkerDb>;
}

/// All tables of one image.
#[derive(Debug, Clone, Default)]
pub struct ImageDatabases {
    pub symbols: SymbolDb,
    pub contributions: ContributionDb,
    pub compilands: CompilandDb,
    pub thunks: ThunkDb,
    pub image_sections: ImageSectionDb,
}

impl ImageDatabases {
    /// Gathers every table of `image`, each one as its own task.
    pub fn gather(provider: &dyn SymbolProvider, image: &Path) -> Result<Self> {
        debug!("Gathering databases of {}", image.display());
        let ((symbols, contributions), ((compilands, thunks), image_sections)) = rayon::join(
            || rayon::join(|| provider.symbols(image), || provider.contributions(image)),
            || {
                rayon::join(
                    || rayon::join(|| provider.compilands(image), || provider.thunks(image)),
                    || provider.image_sections(image),
                )
            },
        );
        Ok(Self {
            symbols: symbols?,
            contributions: contributions?,
            compilands: compilands?,
            thunks: thunks?,
            image_sections: image_sections?,
        })
    }
}
