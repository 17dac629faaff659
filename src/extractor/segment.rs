//! 지식 단위 분할
//!
//! 콘텐츠 종류별로 의미 경계를 지키면서 크기 제한이 있는 단위로 나눕니다.
//! - Paragraph: 문단 = 사실 하나 (티칭, 일반 텍스트)
//! - Markdown: 헤더 섹션 (코드 블록 내부의 `#`은 무시)
//! - Transcript: 발화자 턴을 묶은 대화 구간
//! - Code: 최상위 정의 단위 (앞의 주석 포함)
//!
//! 검색 단위가 곧 노드이므로 청크 간 오버랩은 두지 않습니다.

use std::sync::OnceLock;

use regex::Regex;

/// 분할 크기 제한 (문자 수)
#[derive(Debug, Clone, Copy)]
pub struct SegmentLimits {
    pub min_chars: usize,
    pub max_chars: usize,
}

impl Default for SegmentLimits {
    fn default() -> Self {
        Self {
            min_chars: 8,
            max_chars: 1200,
        }
    }
}

/// 분할 전략
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segmenter {
    Paragraph,
    Markdown,
    Transcript,
    Code,
}

impl Segmenter {
    pub fn name(&self) -> &'static str {
        match self {
            Segmenter::Paragraph => "paragraph",
            Segmenter::Markdown => "markdown",
            Segmenter::Transcript => "transcript",
            Segmenter::Code => "code",
        }
    }

    /// 텍스트를 지식 단위로 분할
    pub fn segment(&self, text: &str, limits: SegmentLimits) -> Vec<String> {
        let text = text.replace("\r\n", "\n");
        if text.trim().is_empty() {
            return Vec::new();
        }

        let max = limits.max_chars.max(16);
        let units = match self {
            Segmenter::Paragraph => split_paragraphs(&text, max),
            Segmenter::Markdown => split_markdown(&text, max),
            Segmenter::Transcript => split_transcript(&text, max),
            Segmenter::Code => split_code(&text, max),
        };

        units
            .into_iter()
            .map(|u| u.trim().to_string())
            .filter(|u| char_len(u) >= limits.min_chars)
            .collect()
    }
}

// ============================================================================
// Strategies
// ============================================================================

fn split_paragraphs(text: &str, max: usize) -> Vec<String> {
    paragraphs(text)
        .into_iter()
        .flat_map(|p| split_oversized(p, max))
        .collect()
}

fn header_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^#{1,6}\s+\S").ok()).as_ref()
}

fn split_markdown(text: &str, max: usize) -> Vec<String> {
    let mut units = Vec::new();
    for section in markdown_sections(text) {
        if char_len(&section) <= max {
            units.push(section);
            continue;
        }

        let mut lines = section.lines();
        let heading = lines
            .next()
            .filter(|l| header_regex().map_or(false, |re| re.is_match(l)))
            .map(str::to_string);
        let body = match &heading {
            Some(h) => section[h.len()..].to_string(),
            None => section.clone(),
        };

        let pieces: Vec<String> = paragraphs(&body)
            .into_iter()
            .flat_map(|p| split_oversized(p, max))
            .collect();
        for (i, piece) in pack(pieces, max, "\n\n").into_iter().enumerate() {
            match &heading {
                // 헤더를 붙여 문맥 유지 (크기 제한 내에서만)
                Some(h) if char_len(h) + 1 + char_len(&piece) <= max => {
                    units.push(format!("{}\n{}", h, piece))
                }
                Some(h) if i == 0 => {
                    units.push(h.clone());
                    units.push(piece);
                }
                _ => units.push(piece),
            }
        }
    }
    units
}

/// 헤더 경계로 섹션 분할 (코드 블록 인식)
fn markdown_sections(text: &str) -> Vec<String> {
    let mut sections = Vec::new();
    let mut current = String::new();
    let mut in_code_block = false;

    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            in_code_block = !in_code_block;
        }

        let is_header = !in_code_block && header_regex().map_or(false, |re| re.is_match(line));
        if is_header && !current.trim().is_empty() {
            sections.push(current.trim().to_string());
            current.clear();
        }

        current.push_str(line);
        current.push('\n');
    }

    if !current.trim().is_empty() {
        sections.push(current.trim().to_string());
    }
    sections
}

fn speaker_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(\[[^\]]{1,40}\]\s*)?[^\s:\[\]]{1,40}:\s").ok())
        .as_ref()
}

fn split_transcript(text: &str, max: usize) -> Vec<String> {
    let mut units = Vec::new();

    // 빈 줄로 구분된 대화 블록은 섞지 않음
    for block in paragraphs(text) {
        let mut turns: Vec<String> = Vec::new();
        for line in block.lines() {
            let starts_turn = speaker_regex().map_or(true, |re| re.is_match(line));
            match turns.last_mut() {
                Some(last) if !starts_turn => {
                    last.push('\n');
                    last.push_str(line);
                }
                _ => turns.push(line.to_string()),
            }
        }

        let pieces: Vec<String> = turns
            .into_iter()
            .flat_map(|t| split_oversized(&t, max))
            .collect();
        units.extend(pack(pieces, max, "\n"));
    }
    units
}

fn definition_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(export\s+)?(pub(\([^)]*\))?\s+)?(async\s+)?(fn|struct|enum|impl|trait|mod|class|def|func|function|interface|type|const|static)\b",
        )
        .ok()
    })
    .as_ref()
}

fn is_comment(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with("//") || t.starts_with('#') || t.starts_with("/*") || t.starts_with('*')
}

fn split_code(text: &str, max: usize) -> Vec<String> {
    let mut blocks: Vec<Vec<&str>> = vec![Vec::new()];

    for line in text.lines() {
        let is_definition = definition_regex().map_or(false, |re| re.is_match(line));
        if is_definition {
            if let Some(current) = blocks.last_mut() {
                // 정의 바로 위의 주석은 새 블록으로 이동
                let mut split_at = current.len();
                while split_at > 0 && is_comment(current[split_at - 1]) {
                    split_at -= 1;
                }
                let leading = current.split_off(split_at);
                blocks.push(leading);
            }
        }
        if let Some(current) = blocks.last_mut() {
            current.push(line);
        }
    }

    let pieces: Vec<String> = blocks
        .into_iter()
        .map(|lines| lines.join("\n"))
        .filter(|b| !b.trim().is_empty())
        .flat_map(|b| {
            if char_len(&b) <= max {
                vec![b]
            } else {
                let lines: Vec<String> = b
                    .lines()
                    .flat_map(|l| split_oversized(l, max))
                    .collect();
                pack(lines, max, "\n")
            }
        })
        .collect();

    pack(pieces, max, "\n\n")
}

// ============================================================================
// Helpers
// ============================================================================

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// 빈 줄 기준 문단 분할
fn paragraphs(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start: Option<usize> = None;
    let mut offset = 0;
    let mut last_end = 0;

    for line in text.split_inclusive('\n') {
        if line.trim().is_empty() {
            if let Some(s) = start.take() {
                out.push(&text[s..last_end]);
            }
        } else {
            if start.is_none() {
                start = Some(offset);
            }
            last_end = offset + line.len();
        }
        offset += line.len();
    }
    if let Some(s) = start {
        out.push(&text[s..last_end]);
    }

    out.into_iter().map(str::trim).filter(|p| !p.is_empty()).collect()
}

/// 문장 경계 분할 (마침표/물음표/느낌표 뒤 공백)
fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut iter = text.char_indices().peekable();

    while let Some((_, c)) = iter.next() {
        if matches!(c, '.' | '!' | '?' | '。') {
            if let Some(&(j, next)) = iter.peek() {
                if next.is_whitespace() {
                    out.push(&text[start..j]);
                    start = j;
                }
            }
        }
    }
    out.push(&text[start..]);

    out.into_iter().map(str::trim).filter(|s| !s.is_empty()).collect()
}

/// 최대 길이를 넘는 텍스트를 줄 → 문장 → 단어 순으로 분할
fn split_oversized(text: &str, max: usize) -> Vec<String> {
    if char_len(text) <= max {
        return vec![text.to_string()];
    }

    let pieces: Vec<String> = text
        .lines()
        .flat_map(sentences)
        .flat_map(|s| {
            if char_len(s) <= max {
                vec![s.to_string()]
            } else {
                hard_wrap(s, max)
            }
        })
        .collect();
    pack(pieces, max, " ")
}

/// 단어 경계에서 강제 분할 (단어 자체가 길면 문자 단위)
fn hard_wrap(text: &str, max: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        if !current.is_empty() && char_len(&current) + 1 + char_len(word) > max {
            out.push(std::mem::take(&mut current));
        }
        if char_len(word) > max {
            let chars: Vec<char> = word.chars().collect();
            let mut chunks = chars.chunks(max).map(|c| c.iter().collect::<String>()).peekable();
            while let Some(chunk) = chunks.next() {
                if chunks.peek().is_some() {
                    out.push(chunk);
                } else {
                    current = chunk;
                }
            }
            continue;
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }

    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// 인접 조각을 최대 길이까지 병합
fn pack(pieces: Vec<String>, max: usize, separator: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for piece in pieces {
        if let Some(last) = out.last_mut() {
            if char_len(last) + char_len(separator) + char_len(&piece) <= max {
                last.push_str(separator);
                last.push_str(&piece);
                continue;
            }
        }
        out.push(piece);
    }
    out
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max: usize) -> SegmentLimits {
        SegmentLimits { min_chars: 8, max_chars: max }
    }

    #[test]
    fn test_empty_input() {
        assert!(Segmenter::Paragraph.segment("  \n\n ", limits(100)).is_empty());
    }

    #[test]
    fn test_paragraph_units() {
        let text = "Restart pod X via kubectl.\n\nPage the DBA on-call when replication lag exceeds 30s.";
        let units = Segmenter::Paragraph.segment(text, limits(200));
        assert_eq!(units.len(), 2);
        assert_eq!(units[0], "Restart pod X via kubectl.");
    }

    #[test]
    fn test_short_units_dropped() {
        let units = Segmenter::Paragraph.segment("ok\n\nRestart pod X via kubectl", limits(200));
        assert_eq!(units, vec!["Restart pod X via kubectl".to_string()]);
    }

    #[test]
    fn test_oversized_paragraph_split_at_sentences() {
        let text = "First sentence is here. Second sentence follows it. Third one ends the paragraph.";
        let units = Segmenter::Paragraph.segment(text, limits(40));
        assert!(units.len() >= 3);
        assert!(units.iter().all(|u| u.chars().count() <= 40));
        assert!(units[0].starts_with("First sentence"));
    }

    #[test]
    fn test_hard_wrap_bounds_long_words() {
        let word = "x".repeat(50);
        let units = Segmenter::Paragraph.segment(&word, limits(20));
        assert_eq!(units.len(), 3);
        assert!(units.iter().all(|u| u.chars().count() <= 20));
    }

    #[test]
    fn test_markdown_sections_ignore_code_comments() {
        let text = "# Restart\n\nUse kubectl.\n\n```bash\n# not a header\nkubectl rollout restart\n```\n\n# Escalate\n\nPage on-call.";
        let units = Segmenter::Markdown.segment(text, limits(500));
        assert_eq!(units.len(), 2);
        assert!(units[0].contains("# not a header"));
        assert!(units[1].starts_with("# Escalate"));
    }

    #[test]
    fn test_markdown_long_section_keeps_heading() {
        let body = (0..6)
            .map(|i| format!("Paragraph number {} explains one runbook step.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let text = format!("## Failover\n\n{}", body);
        let units = Segmenter::Markdown.segment(&text, limits(120));
        assert!(units.len() > 1);
        assert!(units.iter().all(|u| u.starts_with("## Failover")));
        assert!(units.iter().all(|u| u.chars().count() <= 120));
    }

    #[test]
    fn test_transcript_groups_turns() {
        let text = "alice: payments is down\nbob: checking the pods\n  looks like OOM\n\n[10:02] carol: restarted with kubectl";
        let units = Segmenter::Transcript.segment(text, limits(500));
        assert_eq!(units.len(), 2);
        assert!(units[0].contains("looks like OOM"));
        assert!(units[1].starts_with("[10:02] carol"));
    }

    #[test]
    fn test_code_splits_definitions_with_comments() {
        let text = "use std::io;\n\n/// Restarts the pod\nfn restart() {\n    run();\n}\n\n// Drains traffic\nfn drain() {\n    stop();\n}\n";
        let units = Segmenter::Code.segment(text, limits(40));
        assert!(units.iter().any(|u| u.starts_with("/// Restarts the pod\nfn restart")));
        assert!(units.iter().any(|u| u.starts_with("// Drains traffic\nfn drain")));
    }

    #[test]
    fn test_paragraphs_helper() {
        assert_eq!(paragraphs("a\nb\n\n\nc\n"), vec!["a\nb", "c"]);
    }
}
