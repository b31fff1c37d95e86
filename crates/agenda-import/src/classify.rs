use agenda_core::{normalize_token, Department, Reason, ReferenceLabel};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Classification {
    pub department_id: Option<Uuid>,
    pub reason_id: Option<Uuid>,
}

/// Substring matcher over a snapshot of the reference lists.
///
/// Labels are tried in list order and the first one whose normalized form
/// occurs in the normalized summary wins, so with `["CT", "CTS"]` a summary
/// mentioning "CTS" resolves to "CT". A label without any ASCII letter
/// normalizes to the empty string and so matches every summary.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    departments: Vec<(Uuid, String)>,
    reasons: Vec<(Uuid, String)>,
}

impl Classifier {
    pub fn new(departments: &[Department], reasons: &[Reason]) -> Self {
        Self {
            departments: match_tokens(departments),
            reasons: match_tokens(reasons),
        }
    }

    pub fn classify(&self, summary: &str) -> Classification {
        let haystack = normalize_token(summary);
        Classification {
            department_id: first_match(&self.departments, &haystack),
            reason_id: first_match(&self.reasons, &haystack),
        }
    }
}

fn match_tokens<T: ReferenceLabel>(items: &[T]) -> Vec<(Uuid, String)> {
    items
        .iter()
        .map(|item| (item.reference_id(), normalize_token(item.reference_label())))
        .collect()
}

fn first_match(tokens: &[(Uuid, String)], haystack: &str) -> Option<Uuid> {
    tokens
        .iter()
        .find(|(_, token)| haystack.contains(token.as_str()))
        .map(|(id, _)| *id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn department(n: u128, acronym: &str) -> Department {
        Department {
            id: Uuid::from_u128(n),
            acronym: acronym.into(),
            active: true,
        }
    }

    fn reason(n: u128, label: &str) -> Reason {
        Reason {
            id: Uuid::from_u128(n),
            label: label.into(),
            active: true,
        }
    }

    #[test]
    fn matches_ignoring_case_accents_and_punctuation() {
        let classifier = Classifier::new(
            &[department(1, "CT"), department(2, "ST")],
            &[reason(10, "Reunião importante"), reason(11, "Atendimento técnico")],
        );

        let first = classifier.classify("Evento CT - Reunião importante");
        assert_eq!(first.department_id, Some(Uuid::from_u128(1)));
        assert_eq!(first.reason_id, Some(Uuid::from_u128(10)));

        let second = classifier.classify("s.t. / ATENDIMENTO TECNICO");
        assert_eq!(second.department_id, Some(Uuid::from_u128(2)));
        // "TÉCNICO" normalizes to "TCNICO", which "TECNICO" does not contain.
        assert_eq!(second.reason_id, None);
    }

    #[test]
    fn first_listed_label_wins_on_overlap() {
        let summary = "Visita CTS norte";
        let ct_first = Classifier::new(&[department(1, "CT"), department(2, "CTS")], &[]);
        let cts_first = Classifier::new(&[department(2, "CTS"), department(1, "CT")], &[]);

        assert_eq!(ct_first.classify(summary).department_id, Some(Uuid::from_u128(1)));
        assert_eq!(cts_first.classify(summary).department_id, Some(Uuid::from_u128(2)));
    }

    #[test]
    fn misses_leave_identifiers_unresolved() {
        let classifier = Classifier::new(&[department(1, "CT")], &[reason(10, "Vistoria")]);
        assert_eq!(classifier.classify("Almoço"), Classification::default());
        assert_eq!(classifier.classify(""), Classification::default());
    }

    #[test]
    fn labels_without_letters_match_every_summary() {
        let classifier = Classifier::new(&[department(1, "123"), department(2, "ST")], &[]);
        assert_eq!(classifier.classify("Reunião ST").department_id, Some(Uuid::from_u128(1)));
        assert_eq!(classifier.classify("Reunião").department_id, Some(Uuid::from_u128(1)));
        assert_eq!(classifier.classify("").department_id, Some(Uuid::from_u128(1)));

        let listed_last = Classifier::new(&[department(2, "ST"), department(1, "123")], &[]);
        assert_eq!(listed_last.classify("Reunião ST").department_id, Some(Uuid::from_u128(2)));
        assert_eq!(listed_last.classify("Almoço").department_id, Some(Uuid::from_u128(1)));
    }

    #[test]
    fn any_match_is_a_label_contained_in_the_summary() {
        let departments = [
            department(1, "CRF"),
            department(2, "CT"),
            department(3, "ST"),
            department(4, "DEAP"),
            department(5, "2º"),
        ];
        let classifier = Classifier::new(&departments, &[]);
        let summaries = [
            "Reunião DEAP",
            "ct: vistoria",
            "Atendimento - CRF/ST",
            "sem coordenadoria",
            "Costa",
        ];
        for summary in summaries {
            let normalized = normalize_token(summary);
            let expected_any = departments
                .iter()
                .any(|d| normalized.contains(&normalize_token(&d.acronym)));
            match classifier.classify(summary).department_id {
                Some(id) => {
                    let chosen = departments.iter().find(|d| d.id == id).unwrap();
                    assert!(normalized.contains(&normalize_token(&chosen.acronym)));
                }
                None => assert!(!expected_any, "{summary} should have matched"),
            }
        }
    }
}
