use crate::config::Markers;
use crate::error::ValidationError;

/// Cheap structural checks run before any sandbox resource is spent
///
/// Checks, in order: the source is non-empty text, it fits in `max_bytes`, and
/// it contains the entry, body-start and body-end markers in that order. This
/// is purely syntactic; the interpreter owns real correctness.
pub fn validate(source: &str, max_bytes: usize, markers: &Markers) -> Result<(), ValidationError> {
    if source.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    if source.len() > max_bytes {
        return Err(ValidationError::TooLarge {
            len: source.len(),
            max: max_bytes,
        });
    }
    if source.contains('\0') {
        return Err(ValidationError::Binary);
    }

    let lines: Vec<String> = source
        .lines()
        .map(|line| fold(line.trim()))
        .filter(|line| !line.is_empty())
        .collect();

    let entry = fold(&markers.entry);
    let begin = fold(&markers.begin);
    let end = fold(&markers.end);

    let entry_at = lines
        .iter()
        .position(|line| first_word(line) == entry)
        .ok_or_else(|| ValidationError::MissingMarker(markers.entry.clone()))?;
    let begin_at = lines
        .iter()
        .position(|line| first_word(line) == begin)
        .ok_or_else(|| ValidationError::MissingMarker(markers.begin.clone()))?;
    // `FinTantQue` and friends must not count as the closing marker
    let end_at = lines
        .iter()
        .rposition(|line| line.trim_end_matches(['.', ';']) == end)
        .ok_or_else(|| ValidationError::MissingMarker(markers.end.clone()))?;

    if entry_at > begin_at {
        return Err(ValidationError::MarkersOutOfOrder {
            first: markers.entry.clone(),
            second: markers.begin.clone(),
        });
    }
    if begin_at > end_at {
        return Err(ValidationError::MarkersOutOfOrder {
            first: markers.begin.clone(),
            second: markers.end.clone(),
        });
    }

    Ok(())
}

fn first_word(line: &str) -> &str {
    line.split_whitespace().next().unwrap_or("")
}

/// Lowercases and strips accents (`Début`)
fn fold(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'é' | 'è' | 'ê' | 'ë' | 'É' | 'È' | 'Ê' | 'Ë' => 'e',
            'à' | 'â' | 'À' | 'Â' => 'a',
            c => c,
        })
        .flat_map(char::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MAX: usize = 64 * 1024;

    fn check(source: &str) -> Result<(), ValidationError> {
        validate(source, MAX, &Markers::default())
    }

    #[test]
    fn test_accepts_minimal_program() {
        assert_eq!(check("Algorithme A\nDebut\nEcrire(1+1)\nFin"), Ok(()));
    }

    #[test]
    fn test_accepts_case_and_accent_variants() {
        assert_eq!(
            check("  algorithme Somme\n\nDébut\n  Ecrire(2)\nFIN.\n"),
            Ok(())
        );
    }

    #[test]
    fn test_rejects_empty_source() {
        assert_eq!(check(""), Err(ValidationError::Empty));
        assert_eq!(check(" \n\t\n"), Err(ValidationError::Empty));
    }

    #[test]
    fn test_rejects_binary_source() {
        assert_eq!(
            check("Algorithme A\nDebut\0\nFin"),
            Err(ValidationError::Binary)
        );
    }

    #[test]
    fn test_rejects_oversized_source() {
        let body = "Ecrire(1)\n".repeat(10);
        let source = format!("Algorithme A\nDebut\n{body}Fin");
        assert_eq!(
            validate(&source, 32, &Markers::default()),
            Err(ValidationError::TooLarge {
                len: source.len(),
                max: 32
            })
        );
    }

    #[test]
    fn test_rejects_missing_markers() {
        assert_eq!(
            check("not a program"),
            Err(ValidationError::MissingMarker("Algorithme".to_string()))
        );
        assert_eq!(
            check("Algorithme A\nEcrire(1)\nFin"),
            Err(ValidationError::MissingMarker("Debut".to_string()))
        );
        assert_eq!(
            check("Algorithme A\nDebut\nTantQue Vrai Faire\nFinTantQue"),
            Err(ValidationError::MissingMarker("Fin".to_string()))
        );
    }

    #[test]
    fn test_rejects_markers_out_of_order() {
        assert_eq!(
            check("Debut\nAlgorithme A\nFin"),
            Err(ValidationError::MarkersOutOfOrder {
                first: "Algorithme".to_string(),
                second: "Debut".to_string()
            })
        );
        assert_eq!(
            check("Algorithme A\nFin\nDebut"),
            Err(ValidationError::MarkersOutOfOrder {
                first: "Debut".to_string(),
                second: "Fin".to_string()
            })
        );
    }

    #[test]
    fn test_custom_markers() {
        let markers = Markers {
            entry: "program".to_string(),
            begin: "begin".to_string(),
            end: "end".to_string(),
        };
        assert_eq!(validate("program p\nbegin\nend", MAX, &markers), Ok(()));
        assert!(validate("Algorithme A\nDebut\nFin", MAX, &markers).is_err());
    }
}
