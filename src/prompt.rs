//! Prompt assembly: interleaves demonstration examples and batched test
//! questions into one text prompt plus an ordered image-reference list.
//!
//! The model-calling capability binds images to `<<IMG>>` markers
//! positionally, so the image list must follow marker order exactly: all
//! demo images first (in demo order), then all test images (in batch order).

use crate::dataset::ImageStore;
use crate::sampler::DemoExample;
use std::path::PathBuf;

/// Placeholder marker the capability substitutes with an image.
pub const IMAGE_MARKER: &str = "<<IMG>>";

/// A rendered prompt and its positional image references.
#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub text: String,
    pub image_refs: Vec<PathBuf>,
}

impl AssembledPrompt {
    pub fn marker_count(&self) -> usize {
        self.text.matches(IMAGE_MARKER).count()
    }
}

fn choices_line(class_desp: &[String]) -> String {
    format!("{:?}", class_desp)
}

/// Build the prompt for one batch.
///
/// `demos` is already shuffled by the caller for presentation-order
/// randomization; `batch` is the ordered slice of test-example identifiers.
pub fn assemble(
    demos: &[DemoExample],
    batch: &[String],
    class_desp: &[String],
    images: &ImageStore,
) -> AssembledPrompt {
    let choices = choices_line(class_desp);
    let mut text = if demos.is_empty() {
        String::new()
    } else {
        format!("Below are {} demonstrating examples:\n\n", demos.len())
    };
    let mut image_refs = Vec::with_capacity(demos.len() + batch.len());

    for demo in demos {
        image_refs.push(images.demo_image(&demo.id));
        text.push_str(&format!(
            "{IMAGE_MARKER}Given the image above, answer the following question using the specified format.\n\
Question: What is in the image above? Note that this is a binary classification problem, so there will only be one choice.\n\
Choices: {choices}\n\
Answer Choice: {}\n",
            demo.class_desp
        ));
    }

    text.push_str("\n\n\nBelow is the actual question:\n");
    for (idx, id) in batch.iter().enumerate() {
        let qn = idx + 1;
        image_refs.push(images.test_image(id));
        text.push_str(&format!(
            "{IMAGE_MARKER}Given the image above, answer the following question using the specified format.\n\
Question {qn}: What is in the image above? Note that this is a binary classification problem, so there will only be one choice.\n\
Choices {qn}: {choices}\n\n\n"
        ));
    }

    for qn in 1..=batch.len() {
        text.push_str(&format!(
            "\nPlease respond with the following format for each question:\n\
---BEGIN FORMAT TEMPLATE FOR QUESTION {qn}---\n\
Answer Choice {qn}: [Your Answer Choice Here for Question {qn}. If the choice is not present in the image, put an empty list]\n\
Confidence Score {qn}: [Your Numerical Prediction Confidence Score Here From 0 To 1 for Question {qn}]\n\
---END FORMAT TEMPLATE FOR QUESTION {qn}---\n\n\n\
Do not deviate from the above format. Repeat the format template for the answer."
        ));
    }

    AssembledPrompt { text, image_refs }
}
