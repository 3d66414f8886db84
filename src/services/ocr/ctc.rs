// Character set and greedy CTC decoding for the line recognizer

use anyhow::{Context, Result};
use std::path::Path;
use tracing::debug;

/// Timestep rows summing to 1 within this tolerance are already probabilities
const PROBABILITY_SUM_TOLERANCE: f32 = 1e-2;

/// Class index -> text, with the CTC blank at index 0
#[derive(Debug, Clone)]
pub struct Charset {
    symbols: Vec<String>,
}

impl Charset {
    /// Parse a dictionary with one character per line
    ///
    /// `<space>` stands for a literal space. A trailing space class is always
    /// appended, matching recognizers exported with a space character.
    pub fn parse(content: &str) -> Self {
        let mut symbols = vec![String::new()];
        for line in content.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            symbols.push(if line == "<space>" {
                " ".to_string()
            } else {
                line.to_string()
            });
        }
        symbols.push(" ".to_string());
        Self { symbols }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read OCR dictionary {}", path.display()))?;
        let charset = Self::parse(&content);
        if charset.len() <= 2 {
            anyhow::bail!("OCR dictionary {} has no characters", path.display());
        }
        debug!("Loaded {} OCR classes from {}", charset.len(), path.display());
        Ok(charset)
    }

    /// Number of classes including blank
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.len() <= 1
    }

    fn symbol(&self, class: usize) -> Option<&str> {
        match class {
            0 => None,
            i => self.symbols.get(i).map(String::as_str),
        }
    }
}

/// Greedy CTC decode of a `[steps, classes]` score matrix
///
/// Rows that already sum to 1 are used as probabilities, anything else is
/// softmaxed first. Repeats collapse, blanks drop, and the confidence is the
/// mean best-class probability over the kept characters (0 when empty).
pub fn ctc_decode(scores: &[f32], steps: usize, classes: usize, charset: &Charset) -> (String, f32) {
    let mut text = String::new();
    let mut kept_probs = Vec::new();
    let mut prev_class: Option<usize> = None;
    let mut row_probs = vec![0.0f32; classes];

    for t in 0..steps {
        let Some(row) = scores.get(t * classes..(t + 1) * classes) else {
            break;
        };
        to_probabilities(row, &mut row_probs);

        let (best_class, best_prob) = row_probs
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, p)| if p > best.1 { (i, p) } else { best });

        if best_class != 0 && Some(best_class) != prev_class {
            if let Some(symbol) = charset.symbol(best_class) {
                text.push_str(symbol);
                kept_probs.push(best_prob);
            }
        }
        prev_class = Some(best_class);
    }

    let confidence = if kept_probs.is_empty() {
        0.0
    } else {
        kept_probs.iter().sum::<f32>() / kept_probs.len() as f32
    };
    (text, confidence)
}

fn to_probabilities(row: &[f32], out: &mut [f32]) {
    let sum: f32 = row.iter().sum();
    let is_distribution =
        row.iter().all(|&v| v >= 0.0) && (sum - 1.0).abs() <= PROBABILITY_SUM_TOLERANCE;
    if is_distribution {
        out.copy_from_slice(row);
        return;
    }

    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut total = 0.0;
    for (o, &v) in out.iter_mut().zip(row) {
        *o = (v - max).exp();
        total += *o;
    }
    if total > 0.0 {
        out.iter_mut().for_each(|o| *o /= total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn charset() -> Charset {
        // classes: 0 blank, 1 'a', 2 'b', 3 'c', 4 ' ' (dict), 5 ' ' (appended)
        Charset::parse("a\nb\nc\n<space>\n")
    }

    fn one_hot(classes: usize, hot: &[usize], p: f32) -> Vec<f32> {
        let mut out = Vec::new();
        for &h in hot {
            let mut row = vec![(1.0 - p) / (classes - 1) as f32; classes];
            row[h] = p;
            out.extend(row);
        }
        out
    }

    #[test]
    fn test_charset_layout() {
        let cs = charset();
        assert_eq!(cs.len(), 6);
        assert_eq!(cs.symbol(0), None);
        assert_eq!(cs.symbol(1), Some("a"));
        assert_eq!(cs.symbol(4), Some(" "));
        assert_eq!(cs.symbol(5), Some(" "));
        assert_eq!(cs.symbol(6), None);
    }

    #[test]
    fn test_collapse_repeats_and_drop_blanks() {
        let cs = charset();
        // a a _ a b b _ c
        let scores = one_hot(6, &[1, 1, 0, 1, 2, 2, 0, 3], 0.9);
        let (text, confidence) = ctc_decode(&scores, 8, 6, &cs);
        assert_eq!(text, "aabc");
        assert!((confidence - 0.9).abs() < 1e-5);
    }

    #[test]
    fn test_logits_are_softmaxed() {
        let cs = charset();
        let scores = vec![
            0.0, 5.0, 0.0, 0.0, 0.0, 0.0, // 'a'
            9.0, 0.0, 0.0, 0.0, 0.0, 0.0, // blank
            0.0, 0.0, 0.0, 4.0, 0.0, 0.0, // 'c'
        ];
        let (text, confidence) = ctc_decode(&scores, 3, 6, &cs);
        assert_eq!(text, "ac");
        assert!(confidence > 0.9 && confidence <= 1.0);
    }

    #[test]
    fn test_all_blank_is_empty_with_zero_confidence() {
        let cs = charset();
        let scores = one_hot(6, &[0, 0, 0], 0.99);
        assert_eq!(ctc_decode(&scores, 3, 6, &cs), (String::new(), 0.0));
    }

    #[test]
    fn test_decode_is_deterministic() {
        let cs = charset();
        let scores = one_hot(6, &[2, 0, 1, 4, 3], 0.7);
        assert_eq!(ctc_decode(&scores, 5, 6, &cs), ctc_decode(&scores, 5, 6, &cs));
    }

    #[test]
    fn test_load_rejects_empty_dictionary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dict.txt");
        std::fs::write(&path, "\n\n").unwrap();
        assert!(Charset::load(&path).is_err());

        std::fs::write(&path, "x\ny\n").unwrap();
        assert_eq!(Charset::load(&path).unwrap().len(), 4);
    }
}
