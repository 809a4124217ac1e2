pub mod barcode;
pub mod correction;
pub mod extractor;
pub mod normalize;

pub use barcode::BarcodeParser;
pub use extractor::FreeTextExtractor;
