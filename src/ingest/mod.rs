//! Document and image ingestion helpers.

mod documents;
mod images;

pub use documents::{extract_docx_text, extract_xlsx_rows, process_pdf_base64};
pub use images::{CompressedImage, ImageTiers, compress_image};
