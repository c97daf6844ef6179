//! Prompt composition for every agent invocation.
//!
//! Builders are pure: structured context in, prompt string out. No I/O and
//! no globals, so the exact text each agent saw is reproducible in tests.

use swarm_github::ReviewThread;

/// Everything prompt builders are allowed to know.
#[derive(Debug, Clone, Default)]
pub struct PromptContext<'a> {
    pub repo_slug: &'a str,
    pub skills: &'a [String],
}

pub fn build_implement_prompt(ctx: &PromptContext<'_>, issue_number: i64) -> String {
    let mut prompt = format!(
        "Read the AGENT.md file at the root of this repository FIRST and follow every guideline strictly.\n\n\
         Your task: Implement the feature or fix described in issue #{issue_number}.\n\n\
         Step 1 - Read the implementation plan:\n\
         Run `gh issue view {issue_number}` to read the full issue description.\n\
         The issue body contains the implementation plan. It is your complete spec:\n\
         what to build, which files to modify, and the edge cases to handle.\n\n\
         Step 2 - Implement:\n\
         Follow the plan in the issue body step by step.\n\n\
         Step 3 - Test:\n\
         Run the project's test suite and fix failures until it passes.\n\n\
         Step 4 - Commit and push:\n\
         Commit with a message referencing #{issue_number}, then push:\n\
         `git push -u origin fix/issue-{issue_number}`\n\n\
         Step 5 - Create PR:\n\
         `gh pr create --title \"Fix #{issue_number}: <concise title>\" --body \"Closes #{issue_number}\\n\\n<summary>\"`\n\n\
         Important:\n\
         - The issue body IS the plan. Follow it precisely.\n\
         - Do NOT modify files unrelated to the plan.\n\
         - If the plan is unclear, create the PR as a draft and note your questions in its body.\n\
         - Always run tests before creating the PR."
    );
    push_skill_hint(&mut prompt, ctx.skills);
    prompt
}

pub fn build_fix_review_prompt(
    ctx: &PromptContext<'_>,
    pr_number: i64,
    threads: Option<&[ReviewThread]>,
) -> String {
    let mut prompt = format!(
        "Read the AGENT.md file at the root of this repository FIRST and follow every guideline strictly.\n\n\
         Your task: Fix all review feedback on PR #{pr_number}.\n\n"
    );

    match threads {
        Some(threads) if !threads.is_empty() => {
            prompt.push_str("Unresolved review threads:\n");
            prompt.push_str(&render_thread_digest(threads));
            prompt.push_str(
                "\nSteps:\n\
                 1. Address every thread listed above.\n\
                 2. Run the project's test suite and fix failures.\n\
                 3. Commit with message: \"fix: address review comments on PR #",
            );
            prompt.push_str(&pr_number.to_string());
            prompt.push_str("\"\n4. Push to the existing branch.\n");
        }
        _ => {
            let repo = ctx.repo_slug;
            prompt.push_str(&format!(
                "Steps:\n\
                 1. Run `gh pr view {pr_number} --comments` to see the PR and its comments.\n\
                 2. Run `gh api repos/{repo}/pulls/{pr_number}/comments` for inline review comments.\n\
                 3. Implement a fix for each review comment.\n\
                 4. Run the project's test suite and fix failures.\n\
                 5. Commit with message: \"fix: address review comments on PR #{pr_number}\"\n\
                 6. Push to the existing branch.\n"
            ));
        }
    }

    prompt.push_str(
        "\nImportant:\n\
         - Address EVERY comment; do not skip any.\n\
         - Do NOT modify files unrelated to the review comments.\n\
         - If a comment is unclear, reply asking for clarification using `gh pr comment`.",
    );
    push_skill_hint(&mut prompt, ctx.skills);
    prompt
}

/// Continuation prompt for an implement run resumed after a rate-limit pause.
/// The worktree may already contain partial work, so the agent re-reads git
/// state before continuing.
pub fn build_resume_implement_prompt(ctx: &PromptContext<'_>, issue_number: i64) -> String {
    let mut prompt = format!(
        "You were implementing issue #{issue_number} in this worktree and were interrupted by an \
         API rate limit. Your previous work is preserved here.\n\n\
         Step 1 - Re-read the state:\n\
         Run `git status` and `git log --oneline -10` to see what was already done.\n\
         Run `gh issue view {issue_number}` to re-read the plan.\n\n\
         Step 2 - Continue from where you left off. Do not redo completed work.\n\n\
         Step 3 - When the implementation is complete: run the tests, commit, push the branch \
         `fix/issue-{issue_number}`, and create the PR with \
         `gh pr create --title \"Fix #{issue_number}: <concise title>\" --body \"Closes #{issue_number}\"` \
         if one does not already exist."
    );
    push_skill_hint(&mut prompt, ctx.skills);
    prompt
}

/// Continuation prompt for a fix run; threads are re-fetched at resume time
/// so the agent sees the freshest review state.
pub fn build_resume_fix_prompt(
    ctx: &PromptContext<'_>,
    pr_number: i64,
    threads: Option<&[ReviewThread]>,
) -> String {
    let mut prompt = format!(
        "You were fixing review feedback on PR #{pr_number} in this worktree and were interrupted \
         by an API rate limit. Your previous work is preserved here.\n\n\
         Run `git status` and `git log --oneline -10` to see what was already done, then continue.\n\n"
    );
    match threads {
        Some(threads) if !threads.is_empty() => {
            prompt.push_str("Review threads still unresolved:\n");
            prompt.push_str(&render_thread_digest(threads));
        }
        _ => {
            prompt.push_str(&format!(
                "Run `gh pr view {pr_number} --comments` to re-read the outstanding feedback.\n"
            ));
        }
    }
    prompt.push_str(
        "\nWhen every comment is addressed: run the tests, commit, and push to the existing branch.",
    );
    push_skill_hint(&mut prompt, ctx.skills);
    prompt
}

fn render_thread_digest(threads: &[ReviewThread]) -> String {
    let mut digest = String::new();
    for thread in threads {
        match thread.line {
            Some(line) => digest.push_str(&format!("- {}:{line}\n", thread.path)),
            None => digest.push_str(&format!("- {}\n", thread.path)),
        }
        for comment in &thread.comments {
            digest.push_str(&format!("    {}: {}\n", comment.author, comment.body));
        }
    }
    digest
}

fn push_skill_hint(prompt: &mut String, skills: &[String]) {
    if skills.is_empty() {
        return;
    }
    prompt.push_str(&format!(
        "\n\nInstalled skills you may invoke via the Skill tool when relevant: {}.",
        skills.join(", ")
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_github::{ReviewThread, ThreadComment};

    fn ctx<'a>(skills: &'a [String]) -> PromptContext<'a> {
        PromptContext {
            repo_slug: "acme/widgets",
            skills,
        }
    }

    fn thread(path: &str, line: Option<i64>, author: &str, body: &str) -> ReviewThread {
        ReviewThread {
            path: path.to_string(),
            line,
            comments: vec![ThreadComment {
                author: author.to_string(),
                body: body.to_string(),
            }],
        }
    }

    #[test]
    fn implement_prompt_names_issue_and_branch() {
        let prompt = build_implement_prompt(&ctx(&[]), 42);
        assert!(prompt.contains("issue #42"));
        assert!(prompt.contains("gh issue view 42"));
        assert!(prompt.contains("fix/issue-42"));
        assert!(prompt.contains("gh pr create"));
    }

    #[test]
    fn skill_hint_appears_only_when_skills_are_installed() {
        let without = build_implement_prompt(&ctx(&[]), 42);
        assert!(!without.contains("Skill tool"));

        let skills = vec!["deploy".to_string(), "profiling".to_string()];
        let with = build_implement_prompt(&ctx(&skills), 42);
        assert!(with.contains("deploy, profiling"));
        assert!(with.contains("Skill tool"));
    }

    #[test]
    fn fix_prompt_inlines_thread_digest_when_available() {
        let threads = vec![
            thread("src/lib.rs", Some(14), "bob", "rename this"),
            thread("README.md", None, "carol", "typo"),
        ];
        let prompt = build_fix_review_prompt(&ctx(&[]), 99, Some(&threads));
        assert!(prompt.contains("PR #99"));
        assert!(prompt.contains("src/lib.rs:14"));
        assert!(prompt.contains("bob: rename this"));
        assert!(prompt.contains("README.md"));
        assert!(!prompt.contains("gh api repos/"), "no self-fetch when digest is inline");
    }

    #[test]
    fn fix_prompt_falls_back_to_self_fetch_instructions() {
        let prompt = build_fix_review_prompt(&ctx(&[]), 99, None);
        assert!(prompt.contains("gh pr view 99 --comments"));
        assert!(prompt.contains("gh api repos/acme/widgets/pulls/99/comments"));
    }

    #[test]
    fn resume_prompts_instruct_re_reading_git_state() {
        let implement = build_resume_implement_prompt(&ctx(&[]), 42);
        assert!(implement.contains("git status"));
        assert!(implement.contains("rate limit"));
        assert!(implement.contains("fix/issue-42"));

        let fix = build_resume_fix_prompt(&ctx(&[]), 99, None);
        assert!(fix.contains("git status"));
        assert!(fix.contains("gh pr view 99 --comments"));
    }

    #[test]
    fn resume_fix_prompt_uses_fresh_thread_digest() {
        let threads = vec![thread("src/main.rs", Some(3), "dave", "handle error")];
        let prompt = build_resume_fix_prompt(&ctx(&[]), 99, Some(&threads));
        assert!(prompt.contains("src/main.rs:3"));
        assert!(prompt.contains("dave: handle error"));
    }
}
