use crate::chat::{extract_topic, RequestKind};
use crate::reference::{ReferenceDocument, SearchSnippet};

/// Assembles the single prompt string sent to a text model. Pure string
/// templating: the same inputs always produce the identical prompt, and a
/// missing reference degrades to the generic template instead of erroring.
pub fn build_prompt(
    kind: RequestKind,
    raw_text: &str,
    reference: Option<&ReferenceDocument>,
    snippets: &[SearchSnippet],
) -> String {
    match kind {
        RequestKind::Essay => {
            let topic = extract_topic(raw_text);
            match reference {
                Some(reference) => reference_prompt(&topic, reference),
                None => generic_prompt(raw_text),
            }
        }
        RequestKind::General => match reference {
            Some(reference) => reference_prompt(raw_text, reference),
            None => generic_prompt(raw_text),
        },
        RequestKind::Story => with_snippet_block(
            format!(
                "Create an engaging story about:\n{raw_text}\n\n\
                 Make it creative and entertaining with a clear plot."
            ),
            snippets,
        ),
        RequestKind::Song => with_snippet_block(
            format!(
                "Write song lyrics about:\n{raw_text}\n\n\
                 Include verses and a chorus."
            ),
            snippets,
        ),
    }
}

fn reference_prompt(topic: &str, reference: &ReferenceDocument) -> String {
    format!(
        "Based on encyclopedia information about {topic}, provide a comprehensive overview. Include:\n\n\
         1. Introduction: {}\n\n\
         2. Main Content: Present the key information from the article in a clear, organized manner.\n\n\
         3. Additional Details: Include relevant facts and explanations from the article.\n\n\
         Source: {}",
        reference.summary, reference.url
    )
}

fn generic_prompt(raw_text: &str) -> String {
    format!(
        "Please provide a detailed and informative response about:\n{raw_text}\n\n\
         Include relevant facts and explanations."
    )
}

fn with_snippet_block(base: String, snippets: &[SearchSnippet]) -> String {
    let bodies: Vec<String> = snippets
        .iter()
        .filter(|snippet| snippet.has_body())
        .map(|snippet| format!("Reference Information:\n{}\n", snippet.body))
        .collect();
    if bodies.is_empty() {
        return base;
    }
    format!(
        "{base}\n\n\
         Using the following reference information, create your response:\n{}\n\n\
         Please write a well-structured response incorporating this information:",
        bodies.join("\n")
    )
}
