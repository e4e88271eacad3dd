use crate::llm::{Evaluation, GeneratedQuestion};

pub const FALLBACK_MODEL: &str = "fallback";

/// Answers longer than this many characters pass the heuristic evaluation.
const MIN_ANSWER_CHARS: usize = 10;
const EXCERPT_CHARS: usize = 100;

pub struct FeedbackGenerator;

impl FeedbackGenerator {
    /// Generic question built from the start of the note.
    pub fn question(description: &str) -> GeneratedQuestion {
        let excerpt: String = description.trim().chars().take(EXCERPT_CHARS).collect();
        GeneratedQuestion {
            question: format!("Explain in detail: {}...", excerpt),
            model: FALLBACK_MODEL.to_string(),
        }
    }

    pub fn evaluation(user_answer: &str) -> Evaluation {
        let is_correct = user_answer.trim().chars().count() > MIN_ANSWER_CHARS;
        Evaluation {
            is_correct,
            feedback: "Automatic evaluation unavailable. Your answer has been recorded.".to_string(),
        }
    }

    pub fn hint() -> String {
        "Re-read the note carefully and focus on its key idea.".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_question_truncates_description() {
        let long = "x".repeat(250);
        let q = FeedbackGenerator::question(&long);
        assert_eq!(q.model, FALLBACK_MODEL);
        assert_eq!(q.question, format!("Explain in detail: {}...", "x".repeat(100)));

        let short = FeedbackGenerator::question("  Ownership moves values  ");
        assert_eq!(short.question, "Explain in detail: Ownership moves values...");
    }

    #[test]
    fn test_fallback_question_respects_char_boundaries() {
        let accented = "é".repeat(150);
        let q = FeedbackGenerator::question(&accented);
        assert!(q.question.contains(&"é".repeat(100)));
    }

    #[test]
    fn test_heuristic_evaluation() {
        assert!(!FeedbackGenerator::evaluation("too short").is_correct);
        // Ten characters once trimmed.
        assert!(!FeedbackGenerator::evaluation("   exactly10c   ").is_correct);
        assert!(FeedbackGenerator::evaluation("eleven char").is_correct);
        assert!(FeedbackGenerator::evaluation("a value has exactly one owner").is_correct);
        assert!(!FeedbackGenerator::evaluation("").feedback.is_empty());
    }
}
