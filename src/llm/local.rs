//! Keyword rules standing in for a model when no remote provider is configured.

use super::AdvisoryContext;

const RAIN: &str = "മഴ പ്രതീക്ഷിക്കുന്നു. തളിക്കൽ ഒഴിവാക്കുക.";
const WIND: &str = "ഉയർന്ന കാറ്റ്. തളിക്കൽ താമസിപ്പിക്കുക.";
const PEST: &str = "കീട ശ്രദ്ധ. നിരീക്ഷണം നടത്തുക.";
const FERTILIZER: &str = "മണ്ണ് പരിശോധനയ്ക്ക് ശേഷം മാത്രം വളം പ്രയോഗിക്കുക.";
const WATER: &str = "രാവിലെയോ വൈകുന്നേരമോ ജലസേചനം നടത്തുക.";
const GENERIC: &str = "ഞാൻ സഹായിക്കാൻ തയ്യാറാണ്. കൂടുതൽ വിവരങ്ങൾ നൽകുക.";
const ROUTINE: &str = "സാധാരണ കൃഷി പ്രവർത്തനങ്ങൾ തുടരാം.";

const KEYWORDS: &[(&str, &str)] = &[
    ("rain", RAIN),
    ("wind", WIND),
    ("pest", PEST),
    ("fertiliz", FERTILIZER),
    ("water", WATER),
];

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalProvider;

impl LocalProvider {
    pub fn complete(&self, prompt: &str) -> String {
        let lowered = prompt.to_lowercase();
        KEYWORDS
            .iter()
            .find(|(k, _)| lowered.contains(k))
            .map(|(_, reply)| *reply)
            .unwrap_or(GENERIC)
            .to_string()
    }

    pub fn advise(&self, ctx: &AdvisoryContext) -> String {
        let text = if ctx.rain_24h_mm.is_some_and(|r| r > 10.0) {
            RAIN
        } else if ctx.wind_speed_ms.is_some_and(|w| w > 6.0) {
            WIND
        } else if ctx.pest_alert {
            PEST
        } else {
            ROUTINE
        };
        text.to_string()
    }
}
