//! # owui-hugo
//!
//! A CLI tool that turns [Open WebUI](https://openwebui.com) chat exports into
//! [Hugo](https://gohugo.io) posts, keeping hand-written annotations across
//! re-exports.
//!
//! ## What it does
//!
//! Each conversation becomes `<output>/<YYYY-MM>/<YYYY-MM-DD>-<slug>.md`, where
//! the slug is the name of the first emoji in the chat title (or the chat id).
//! User turns are wrapped in a `notice tip` shortcode, assistant turns are
//! written as-is.
//!
//! ## Annotations
//!
//! A file with the same relative path under `--metadir` is the *annotation
//! file* of that post. Its front matter overrides the generated metadata, and
//! its body is spliced between the messages, steered by directives:
//!
//! ```text
//! ---
//! categories: [travel]
//! history: [8d3c…]        # pick the branch that contains this message
//! skip_n: [4, 5]          # leave out messages #4 and #5
//! authors_add: [me]
//! ---
//! Shown before the first message.
//! <!-- skip 2 -->
//! Shown before message #2.
//! <!-- seek 8d3c… -->
//! Shown before message 8d3c….
//! <!-- seek tail -->
//! Shown after the last message.
//! ```
//!
//! Annotation files are created empty on first export and never overwritten
//! (unless `--normalize` is given).
//!
//! ## Usage
//!
//! ```sh
//! owui-hugo chats.json --output site/content/posts --metadir notes
//! owui-hugo --db ~/.open-webui/webui.db --output site/content/posts --jobs 4
//! ```
//!
//! Preferences can be persisted in `~/.config/owui-hugo/config.toml`.
pub mod directive;
pub mod frontmatter;
pub mod graph;
pub mod importer;
pub mod parallel;
pub mod pipeline;
pub mod renderer;
pub mod utils;
