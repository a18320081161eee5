//! Llama-3 Instruct prompt templates (French clinical register).
//!
//! `<|begin_of_text|>` is added by the runtime as BOS and must not appear
//! here.

/// Sections of a SmartNote, in output order.
pub const SECTIONS: [&str; 8] = [
    "Motif",
    "Antecedents",
    "Examen",
    "Plan",
    "Risques",
    "Recommandations",
    "Prochain RDV",
    "Admin",
];

/// Wrap a system and user turn in the Llama-3 chat template, leaving the
/// assistant turn open.
pub fn llama3(system: &str, user: &str) -> String {
    format!(
        "<|start_header_id|>system<|end_header_id|>\n\n{system}<|eot_id|>\
         <|start_header_id|>user<|end_header_id|>\n\n{user}<|eot_id|>\
         <|start_header_id|>assistant<|end_header_id|>\n\n"
    )
}

const SMARTNOTE_SYSTEM: &str = "Tu es un assistant de documentation dentaire. \
Tu generes des SmartNotes concises et structurees en francais \
a partir de transcriptions de consultations. \
Reponds uniquement avec la SmartNote au format demande, sans commentaires ni explications.";

const SMARTNOTE_FORMAT: &str = "Format:\n\
- Motif : [raison consultation]\n\
- Antecedents : [historique pertinent]\n\
- Examen : [observations cliniques]\n\
- Plan : [traitements proposes]\n\
- Risques : [risques identifies]\n\
- Recommandations : [conseils patient]\n\
- Prochain RDV : [prochaine etape]\n\
- Admin : [devis/paiement si mentionne]";

const RAG_SYSTEM: &str = "Tu es un assistant de documentation dentaire expert. \
Tu generes des SmartNotes concises et structurees en francais \
a partir de transcriptions de consultations. \
Tu disposes de references medicales pertinentes pour enrichir \
et verifier tes recommandations. \
Utilise les references pour verifier les protocoles mentionnes, \
signaler les risques medicamenteux et enrichir les recommandations. \
Reponds uniquement avec la SmartNote au format demande.";

const RAG_FORMAT: &str = "Format:\n\
- Motif : [raison consultation]\n\
- Antecedents : [historique pertinent]\n\
- Examen : [observations cliniques]\n\
- Plan : [traitements proposes]\n\
- Risques : [risques identifies, interactions medicamenteuses]\n\
- Recommandations : [conseils patient, appuyes par les references]\n\
- Prochain RDV : [prochaine etape]\n\
- Admin : [devis/paiement si mentionne]";

const CHUNK_SYSTEM: &str = "Tu es un assistant dentaire. \
Resume les transcriptions de consultations de maniere concise en francais.";

const COMBINE_SYSTEM: &str = "Tu es un assistant de documentation dentaire. \
Tu combines des resumes partiels en une SmartNote finale structuree en francais.";

/// Direct SmartNote prompt for a transcript that fits in one call.
pub fn smartnote(transcript: &str) -> String {
    llama3(
        SMARTNOTE_SYSTEM,
        &format!(
            "Genere une SmartNote (5-10 lignes) pour cette consultation.\n\n\
             {SMARTNOTE_FORMAT}\n\nTranscription:\n{transcript}"
        ),
    )
}

/// SmartNote prompt grounded by retrieved references. Falls back to
/// [`smartnote`] when `context` is blank.
pub fn smartnote_with_context(transcript: &str, context: &str) -> String {
    if context.trim().is_empty() {
        return smartnote(transcript);
    }
    llama3(
        RAG_SYSTEM,
        &format!(
            "Genere une SmartNote (5-10 lignes) pour cette consultation.\n\n\
             References medicales pertinentes:\n{context}\n\n\
             {RAG_FORMAT}\n\nTranscription:\n{transcript}"
        ),
    )
}

/// Partial summary of chunk `part` of `total` (1-based).
pub fn chunk_summary(part: usize, total: usize, text: &str) -> String {
    llama3(
        CHUNK_SYSTEM,
        &format!("Resume cette partie ({part}/{total}) de la consultation:\n\n{text}"),
    )
}

/// Merge partial summaries into the final structured note.
pub fn combine_summaries(summaries: &str) -> String {
    let outline: String = SECTIONS
        .iter()
        .map(|s| format!("\n- {s} : ..."))
        .collect();
    llama3(
        COMBINE_SYSTEM,
        &format!(
            "Combine ces resumes en une SmartNote finale (5-10 lignes):\n\n\
             {summaries}\n\nFormat:{outline}"
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_leaves_assistant_turn_open() {
        let p = llama3("sys", "usr");
        assert!(p.starts_with("<|start_header_id|>system<|end_header_id|>\n\nsys<|eot_id|>"));
        assert!(p.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
        assert!(!p.contains("<|begin_of_text|>"));
    }

    #[test]
    fn every_prompt_lists_all_sections() {
        for prompt in [
            smartnote("t"),
            smartnote_with_context("t", "[ref]\nx"),
            combine_summaries("a\n\nb"),
        ] {
            for section in SECTIONS {
                assert!(prompt.contains(&format!("- {section} :")), "missing {section}");
            }
        }
    }

    #[test]
    fn chunk_prompt_carries_part_numbers() {
        let p = chunk_summary(1, 3, "chunk text");
        assert!(p.contains("(1/3)"));
        assert!(p.contains("chunk text"));
    }

    #[test]
    fn empty_context_falls_back_to_plain_prompt() {
        assert_eq!(smartnote_with_context("t", "  "), smartnote("t"));
        let grounded = smartnote_with_context("t", "[guide]\nrincer");
        assert!(grounded.contains("References medicales pertinentes:\n[guide]\nrincer"));
    }
}
