use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::model::work_item::WorkItem;

const MAX_BRANCH_LEN: usize = 250;

const INVALID_SEQUENCES: [&str; 9] = ["..", "~", "^", ":", "?", "*", "[", "\\", " "];

const REF_PREFIXES: [&str; 3] = ["refs/remotes/origin/", "refs/heads/", "origin/"];

static TITLE_BRACKET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[\s*branch\s*:\s*([^\]]*)\]").expect("static regex"));

static BRANCH_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bbranch\s*:\s*(\S+)").expect("static regex"));

static TICKET_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[\s(\[,;])(\d+-[A-Za-z][\w.\-/]*)").expect("static regex")
});

static PREFIXED_BRANCH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[\s(\[,;:])((?i:feature|bugfix|hotfix|release)/[\w.\-/]+)")
        .expect("static regex")
});

static LONG_LIVED_BRANCH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(develop|staging)\b").expect("static regex"));

/// Which rule produced a branch, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchSource {
    Relation,
    TitleBracket,
    BranchToken,
    TicketToken,
    ConventionalPrefix,
    CustomField,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchResolution {
    pub branch: String,
    pub source: BranchSource,
}

type Rule = (BranchSource, fn(&WorkItem) -> Vec<String>);

const RULES: [Rule; 6] = [
    (BranchSource::Relation, relation_candidates),
    (BranchSource::TitleBracket, title_bracket_candidates),
    (BranchSource::BranchToken, branch_token_candidates),
    (BranchSource::TicketToken, ticket_token_candidates),
    (BranchSource::ConventionalPrefix, conventional_candidates),
    (BranchSource::CustomField, custom_field_candidates),
];

/// First valid branch found by the rules above, or `None` to use the default branch.
pub fn resolve_branch(item: &WorkItem) -> Option<BranchResolution> {
    for (source, candidates) in RULES {
        for raw in candidates(item) {
            let branch = strip_ref_prefix(raw.trim());
            if is_valid_branch_name(branch) {
                tracing::debug!(work_item = item.id, ?source, branch, "resolved branch");
                return Some(BranchResolution {
                    branch: branch.to_string(),
                    source,
                });
            }
            tracing::debug!(work_item = item.id, ?source, candidate = %raw, "rejected branch candidate");
        }
    }
    None
}

pub fn is_valid_branch_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_BRANCH_LEN {
        return false;
    }
    if INVALID_SEQUENCES.iter().any(|seq| name.contains(seq)) {
        return false;
    }
    !(name.starts_with('.') || name.ends_with('.') || name.starts_with('/') || name.ends_with('/'))
}

pub fn strip_ref_prefix(name: &str) -> &str {
    REF_PREFIXES
        .iter()
        .find_map(|prefix| name.strip_prefix(prefix))
        .unwrap_or(name)
}

/// `vstfs:///GitHub/Branch/{repo-guid}%2F{branch}`; the branch part is itself percent-encoded.
fn github_branch_from_url(url: &str) -> Option<String> {
    let (_, rest) = url.split_once("GitHub/Branch/")?;
    let (_repo, encoded) = rest.split_once("%2F")?;
    urlencoding::decode(encoded).ok().map(|b| b.into_owned())
}

/// `vstfs:///Git/Ref/{project}%2F{repo}%2FGB{branch}`
fn git_branch_from_url(url: &str) -> Option<String> {
    let (_, rest) = url.split_once("/Git/Ref/")?;
    let (_, encoded) = rest.split_once("%2FGB")?;
    urlencoding::decode(encoded).ok().map(|b| b.into_owned())
}

fn relation_candidates(item: &WorkItem) -> Vec<String> {
    let links = item.relations.iter().filter(|r| r.is_artifact_link());
    let github = links
        .clone()
        .filter_map(|r| github_branch_from_url(&r.url));
    let git = links.filter_map(|r| git_branch_from_url(&r.url));
    github.chain(git).collect()
}

fn title_bracket_candidates(item: &WorkItem) -> Vec<String> {
    TITLE_BRACKET
        .captures_iter(&item.title)
        .map(|c| c[1].trim().to_string())
        .collect()
}

fn branch_token_candidates(item: &WorkItem) -> Vec<String> {
    let mut out: Vec<String> = BRANCH_TOKEN
        .captures_iter(&item.free_text())
        .map(|c| trim_token(&c[1]))
        .collect();
    for tag in &item.tags {
        if let Some((key, value)) = tag.split_once(':') {
            if key.trim().eq_ignore_ascii_case("branch") {
                out.push(value.trim().to_string());
            }
        }
    }
    out
}

fn scanned_text(item: &WorkItem) -> Vec<String> {
    let mut texts = vec![item.title.clone(), item.free_text()];
    texts.extend(item.tags.iter().cloned());
    texts
}

fn ticket_token_candidates(item: &WorkItem) -> Vec<String> {
    scanned_text(item)
        .iter()
        .flat_map(|text| {
            TICKET_TOKEN
                .captures_iter(text)
                .map(|c| trim_token(&c[1]))
                .collect::<Vec<_>>()
        })
        .collect()
}

fn conventional_candidates(item: &WorkItem) -> Vec<String> {
    let texts = scanned_text(item);
    let prefixed = texts.iter().flat_map(|text| {
        PREFIXED_BRANCH
            .captures_iter(text)
            .map(|c| trim_token(&c[1]))
            .collect::<Vec<_>>()
    });
    let long_lived = texts.iter().flat_map(|text| {
        LONG_LIVED_BRANCH
            .captures_iter(text)
            .map(|c| c[1].to_string())
            .collect::<Vec<_>>()
    });
    prefixed.chain(long_lived).collect()
}

fn custom_field_candidates(item: &WorkItem) -> Vec<String> {
    item.custom_fields
        .iter()
        .filter(|(key, value)| key.to_lowercase().contains("branch") && !value.trim().is_empty())
        .map(|(_, value)| value.clone())
        .collect()
}

/// Sentence punctuation glued to the end of a token is not part of the branch.
fn trim_token(token: &str) -> String {
    token
        .trim_end_matches(['.', ',', ';', ':', ')', ']', '!', '"', '\''])
        .to_string()
}
