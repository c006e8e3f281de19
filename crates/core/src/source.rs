//! Source preprocessing applied before a score reaches a renderer
//! child.
//!
//! Two passes: a backend-selection prefix, then a rewrite of known
//! engraver includes. The upstream line server extracts `\include`
//! directives with a regex and resolves them against its own search
//! path; doubling the space after `\include` for the engraver's
//! bundled include files keeps that regex from matching, so the
//! engraver resolves them from its global path instead.

use crate::types::Backend;

/// Include files bundled with the engraver. `\include` directives
/// naming these are rewritten, everything else is left for the line
/// server to resolve.
pub const ENGRAVER_INCLUDES: &[&str] = &[
    "Welcome-to-LilyPond-MacOS.ly",
    "Welcome_to_LilyPond.ly",
    "arabic.ly",
    "articulate.ly",
    "bagpipe.ly",
    "base-tkit.ly",
    "catalan.ly",
    "chord-modifiers-init.ly",
    "chord-repetition-init.ly",
    "context-mods-init.ly",
    "declarations-init.ly",
    "deutsch.ly",
    "drumpitch-init.ly",
    "dynamic-scripts-init.ly",
    "english.ly",
    "engraver-init.ly",
    "espanol.ly",
    "event-listener.ly",
    "festival.ly",
    "generate-documentation.ly",
    "generate-interface-doc-init.ly",
    "grace-init.ly",
    "graphviz-init.ly",
    "gregorian.ly",
    "guile-debugger.ly",
    "hel-arabic.ly",
    "init.ly",
    "italiano.ly",
    "lilypond-book-preamble.ly",
    "lyrics-tkit.ly",
    "makam.ly",
    "midi-init.ly",
    "music-functions-init.ly",
    "nederlands.ly",
    "norsk.ly",
    "paper-defaults-init.ly",
    "performer-init.ly",
    "piano-tkit.ly",
    "portugues.ly",
    "predefined-fretboards-init.ly",
    "predefined-guitar-fretboards.ly",
    "predefined-guitar-ninth-fretboards.ly",
    "predefined-mandolin-fretboards.ly",
    "predefined-ukulele-fretboards.ly",
    "property-init.ly",
    "satb.ly",
    "scale-definitions-init.ly",
    "scheme-sandbox.ly",
    "script-init.ly",
    "spanners-init.ly",
    "ssaattbb.ly",
    "staff-tkit.ly",
    "string-tunings-init.ly",
    "suomi.ly",
    "svenska.ly",
    "text-replacements.ly",
    "titling-init.ly",
    "toc-init.ly",
    "vlaams.ly",
    "vocal-tkit.ly",
    "voice-tkit.ly",
];

/// Prepare a score for the renderer child's stdin.
///
/// `svg` gets the backend-selection directive prepended, `pdf` a blank
/// line (keeping line numbers in engraver diagnostics one-off
/// consistent between the two), and `musicxml2ly` input is not music
/// notation at all and passes through unprefixed. The include rewrite
/// applies to all backends.
pub fn preprocess(src: &str, backend: Backend) -> String {
    let mut out = String::with_capacity(src.len() + 64);
    match backend {
        Backend::Svg => {
            out.push_str("#(ly:set-option 'backend 'svg)\n");
        }
        Backend::Pdf => {
            out.push('\n');
        }
        Backend::Musicxml2ly => {}
    }
    out.push_str(src);

    for name in ENGRAVER_INCLUDES {
        let from = format!("\\include \"{name}\"");
        let to = format!("\\include  \"{name}\"");
        out = out.replace(&from, &to);
    }

    out
}
