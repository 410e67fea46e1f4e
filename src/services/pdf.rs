//! One image per page, sized at 96 dpi.

use crate::core::error::PipelineError;
use crate::core::io::Storage;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use image::RgbImage;
use log::{info, warn};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream};
use std::io::Write;

#[derive(Debug, Clone, PartialEq)]
pub struct PdfReport {
    pub path: String,
    pub pages: usize,
    /// `(path, reason)` for every image left out.
    pub skipped: Vec<(String, String)>,
}

pub async fn assemble_pdf(
    storage: &dyn Storage,
    image_paths: &[String],
    output_path: &str,
) -> Result<PdfReport, PipelineError> {
    let mut builder = PageBuilder::new();
    let mut skipped = Vec::new();

    // Each image is compressed into the document as soon as it is decoded.
    for path in image_paths {
        match load_rgb(storage, path).await {
            Ok(img) => builder.add_page(&img)?,
            Err(e) => {
                warn!("Skipping {} in PDF: {}", path, e);
                skipped.push((path.clone(), e.to_string()));
            }
        }
    }

    let pages = builder.pages();
    if pages == 0 {
        return Err(PipelineError::Pdf(format!(
            "none of the {} listed images could be used",
            image_paths.len()
        )));
    }

    let bytes = builder.finish()?;
    storage.write(output_path, &bytes).await?;
    info!("Wrote {} ({} pages, {} skipped)", output_path, pages, skipped.len());

    Ok(PdfReport {
        path: output_path.to_string(),
        pages,
        skipped,
    })
}

async fn load_rgb(storage: &dyn Storage, path: &str) -> Result<RgbImage, PipelineError> {
    if !storage.exists(path).await? {
        return Err(PipelineError::Pdf("file is missing".to_string()));
    }
    let bytes = storage.read(path).await?;
    Ok(image::load_from_memory(&bytes)?.to_rgb8())
}

fn px_to_pt(px: u32) -> i64 {
    (px as i64 * 72 / 96).max(1)
}

struct PageBuilder {
    doc: Document,
    pages_id: ObjectId,
    kids: Vec<Object>,
}

impl PageBuilder {
    fn new() -> Self {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        Self {
            doc,
            pages_id,
            kids: Vec::new(),
        }
    }

    fn pages(&self) -> usize {
        self.kids.len()
    }

    fn add_page(&mut self, img: &RgbImage) -> Result<(), PipelineError> {
        let (w, h) = img.dimensions();
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(img.as_raw())?;
        let data = encoder.finish()?;

        let image_id = self.doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => w as i64,
                "Height" => h as i64,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8_i64,
                "Filter" => "FlateDecode",
            },
            data,
        ));

        let (pw, ph) = (px_to_pt(w), px_to_pt(h));
        let content = Content {
            operations: vec![
                Operation::new("q", vec![]),
                Operation::new(
                    "cm",
                    vec![pw.into(), 0_i64.into(), 0_i64.into(), ph.into(), 0_i64.into(), 0_i64.into()],
                ),
                Operation::new("Do", vec![Object::Name(b"Im0".to_vec())]),
                Operation::new("Q", vec![]),
            ],
        };
        let encoded = content
            .encode()
            .map_err(|e| PipelineError::Pdf(e.to_string()))?;
        let content_id = self.doc.add_object(Stream::new(dictionary! {}, encoded));

        let page_id = self.doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => self.pages_id,
            "MediaBox" => vec![0_i64.into(), 0_i64.into(), pw.into(), ph.into()],
            "Contents" => content_id,
            "Resources" => dictionary! {
                "XObject" => dictionary! { "Im0" => image_id },
            },
        });
        self.kids.push(page_id.into());
        Ok(())
    }

    fn finish(self) -> Result<Vec<u8>, PipelineError> {
        let Self {
            mut doc,
            pages_id,
            kids,
        } = self;
        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut out = Vec::new();
        doc.save_to(&mut out)
            .map_err(|e| PipelineError::Pdf(e.to_string()))?;
        Ok(out)
    }
}
