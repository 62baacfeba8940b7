/// A `-filter_complex` graph under construction, together with the inputs it
/// references. Keeping the graph as a value (instead of ad-hoc string
/// concatenation) makes each stage inspectable and the final command line
/// reproducible for identical inputs.
#[derive(Debug, Default)]
pub struct FilterGraph {
    inputs: Vec<Vec<String>>,
    chains: Vec<String>,
    label_seq: u32,
}

impl FilterGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an input and return its ffmpeg index.
    pub fn add_input<I, S>(&mut self, args: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let index = self.inputs.len();
        self.inputs.push(args.into_iter().map(Into::into).collect());
        index
    }

    /// Append one `filter_complex` statement (already labeled).
    pub fn add_chain(&mut self, chain: impl Into<String>) {
        self.chains.push(chain.into());
    }

    /// Mint a fresh unique label (without brackets).
    pub fn label(&mut self, prefix: &str) -> String {
        let label = format!("{prefix}_{}", self.label_seq);
        self.label_seq += 1;
        label
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// All `-i`-style input argument groups, flattened in index order.
    pub fn input_args(&self) -> Vec<String> {
        self.inputs.iter().flatten().cloned().collect()
    }

    /// Render the `-filter_complex` argument value.
    pub fn render(&self) -> String {
        self.chains.join(";")
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inputs_keep_their_indices() {
        let mut g = FilterGraph::new();
        let bg = g.add_input(["-loop", "1", "-i", "bg.png"]);
        let voice = g.add_input(["-i", "voice.wav"]);
        assert_eq!(bg, 0);
        assert_eq!(voice, 1);
        assert_eq!(g.input_count(), 2);
        assert_eq!(
            g.input_args(),
            vec!["-loop", "1", "-i", "bg.png", "-i", "voice.wav"]
        );
    }

    #[test]
    fn test_render_joins_chains_in_order() {
        let mut g = FilterGraph::new();
        g.add_chain("[0:v]scale=1920:1080[bg]");
        g.add_chain("[bg][1:v]overlay=x=0:y=0[out]");
        assert_eq!(
            g.render(),
            "[0:v]scale=1920:1080[bg];[bg][1:v]overlay=x=0:y=0[out]"
        );
    }

    #[test]
    fn test_labels_are_unique() {
        let mut g = FilterGraph::new();
        let a = g.label("tmp");
        let b = g.label("tmp");
        assert_ne!(a, b);
    }
}
