use rustfft::{num_complex::Complex64, FftPlanner};

/// Above this many multiply-adds the dot products go through an FFT.
const DIRECT_WORK_LIMIT: usize = 1 << 16;
const ENERGY_EPSILON: f64 = 1.0e-8;
const SILENT_TEMPLATE: f64 = 1.0e-12;

/// Normalised correlation of `template` at every offset inside `window`.
///
/// `score[o] = dot(window[o..o + n], template) / sqrt(energy(window[o..o + n]) + 1e-8)`
/// for `o` in `0..=window.len() - n`, where `n = template.len()`.
pub fn sola_scores(window: &[f32], template: &[f32]) -> Vec<f64> {
    let n = template.len();
    if n == 0 || window.len() < n {
        return Vec::new();
    }
    let offsets = window.len() - n + 1;

    let dots = if n.saturating_mul(offsets) <= DIRECT_WORK_LIMIT {
        direct_dots(window, template, offsets)
    } else {
        fft_dots(window, template, offsets)
    };

    let mut prefix = Vec::with_capacity(window.len() + 1);
    prefix.push(0.0_f64);
    let mut acc = 0.0_f64;
    for &s in window {
        acc += (s as f64) * (s as f64);
        prefix.push(acc);
    }

    dots.into_iter()
        .enumerate()
        .map(|(o, dot)| {
            let energy = (prefix[o + n] - prefix[o]).max(0.0);
            dot / (energy + ENERGY_EPSILON).sqrt()
        })
        .collect()
}

/// Offset in `0..=max_offset` where `template` lines up best with `window`.
///
/// Ties resolve to the lowest offset; a silent template always yields 0.
pub fn best_sola_offset(window: &[f32], template: &[f32], max_offset: usize) -> usize {
    let template_energy: f64 = template.iter().map(|&v| (v as f64) * (v as f64)).sum();
    if template_energy <= SILENT_TEMPLATE {
        return 0;
    }
    let limit = template.len() + max_offset;
    let window = &window[..window.len().min(limit)];
    let scores = sola_scores(window, template);
    let Some(best) = scores.iter().copied().reduce(f64::max) else {
        return 0;
    };

    // FFT rounding can split an exact tie, so accept anything within noise.
    let tolerance = 1.0e-9 * best.abs().max(1.0);
    scores
        .iter()
        .position(|&s| s >= best - tolerance)
        .unwrap_or(0)
}

fn direct_dots(window: &[f32], template: &[f32], offsets: usize) -> Vec<f64> {
    (0..offsets)
        .map(|o| {
            window[o..o + template.len()]
                .iter()
                .zip(template)
                .map(|(&a, &b)| (a as f64) * (b as f64))
                .sum()
        })
        .collect()
}

fn fft_dots(window: &[f32], template: &[f32], offsets: usize) -> Vec<f64> {
    let size = window.len().next_power_of_two();
    let mut planner = FftPlanner::<f64>::new();
    let forward = planner.plan_fft_forward(size);
    let inverse = planner.plan_fft_inverse(size);

    let zero = Complex64::new(0.0, 0.0);
    let mut a = vec![zero; size];
    for (dst, &s) in a.iter_mut().zip(window) {
        *dst = Complex64::new(s as f64, 0.0);
    }
    let mut b = vec![zero; size];
    for (dst, &s) in b.iter_mut().zip(template) {
        *dst = Complex64::new(s as f64, 0.0);
    }

    forward.process(&mut a);
    forward.process(&mut b);
    for (x, y) in a.iter_mut().zip(&b) {
        *x *= y.conj();
    }
    inverse.process(&mut a);

    let scale = 1.0 / size as f64;
    a.iter().take(offsets).map(|c| c.re * scale).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chirp(len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| {
                let t = i as f32 / 16_000.0;
                (2.0 * std::f32::consts::PI * (200.0 + 900.0 * t) * t).sin()
            })
            .collect()
    }

    #[test]
    fn finds_the_planted_offset() {
        let signal = chirp(600);
        let template = signal[37..37 + 256].to_vec();
        assert_eq!(best_sola_offset(&signal, &template, 100), 37);
    }

    #[test]
    fn fft_and_direct_paths_agree() {
        let signal = chirp(3_000);
        let template = signal[211..211 + 2_048].to_vec();
        let window = &signal[..2_048 + 400];
        let offsets = window.len() - template.len() + 1;

        let direct = direct_dots(window, &template, offsets);
        let fft = fft_dots(window, &template, offsets);
        for (d, f) in direct.iter().zip(&fft) {
            assert!((d - f).abs() < 1e-6 * d.abs().max(1.0));
        }
        assert_eq!(best_sola_offset(window, &template, 400), 211);
    }

    #[test]
    fn silent_template_selects_zero() {
        let signal = chirp(300);
        assert_eq!(best_sola_offset(&signal, &[0.0; 64], 100), 0);
    }

    #[test]
    fn ties_resolve_to_lowest_offset() {
        let window = vec![1.0_f32; 20];
        assert_eq!(best_sola_offset(&window, &[1.0; 4], 10), 0);
    }

    #[test]
    fn scores_are_energy_normalised() {
        let window = [0.0_f32, 0.0, 2.0, 2.0];
        let scores = sola_scores(&window, &[1.0, 1.0]);
        assert_eq!(scores.len(), 3);
        assert!(scores[0].abs() < 1e-9);
        assert!((scores[2] - 4.0 / 8.0_f64.sqrt()).abs() < 1e-6);
    }
}
