//! Reference filtering results for the 40,000-row `testcruise` fixture.
//!
//! The fixture is not committed. Place it at
//! `tests/testcruise/2014_185/2014-07-04T00-00-02+00-00` and run with
//! `cargo test --test reference_scenarios -- --ignored`.

use seaflow_opp::evt::{decode_file, Channel};
use seaflow_opp::gating::{FilterOptions, GatingEngine};
use seaflow_opp::stats::calc_stats;
use std::path::PathBuf;

fn fixture() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/testcruise/2014_185/2014-07-04T00-00-02+00-00")
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        ((actual - expected) / expected).abs() < 1e-7,
        "{actual} != {expected}"
    );
}

#[test]
#[ignore = "needs tests/testcruise fixture"]
fn test_default_filter_params() {
    let file = decode_file(&fixture()).unwrap();
    assert_eq!(file.len(), 40_000);

    let mut engine = GatingEngine::new(&file);
    let result = engine.gate(&FilterOptions::new(0.5, 0.0)).unwrap();
    assert_eq!(result.opp_count(), 345);
    let params = result.params();
    assert_eq!(params.width, 0.5);
    assert_eq!(params.offset, 0.0);
    assert_eq!(params.origin, -1792.0);
    assert!((params.notch1 - 0.7668803418803419313932).abs() < 1e-15);
    assert!((params.notch2 - 0.7603813559322033510668).abs() < 1e-15);
}

#[test]
#[ignore = "needs tests/testcruise fixture"]
fn test_explicit_filter_params() {
    let file = decode_file(&fixture()).unwrap();
    let mut engine = GatingEngine::new(&file);
    let opts = FilterOptions::new(0.75, 100.0)
        .with_notches(1.5, 1.1)
        .with_origin(-1000.0);
    let result = engine.gate(&opts).unwrap();
    assert_eq!(result.opp_count(), 2812);
    assert_eq!(result.params().origin, -1000.0);
}

#[test]
#[ignore = "needs tests/testcruise fixture"]
fn test_regating_overwrites_previous_result() {
    let file = decode_file(&fixture()).unwrap();
    let mut engine = GatingEngine::new(&file);
    assert_eq!(engine.gate(&FilterOptions::new(0.5, 0.0)).unwrap().opp_count(), 345);
    let opts = FilterOptions::new(0.75, 100.0)
        .with_notches(1.5, 1.1)
        .with_origin(-1000.0);
    assert_eq!(engine.gate(&opts).unwrap().opp_count(), 2812);
    assert_eq!(engine.gate(&FilterOptions::new(0.5, 0.0)).unwrap().opp_count(), 345);
}

#[test]
#[ignore = "needs tests/testcruise fixture"]
fn test_reference_stats() {
    let file = decode_file(&fixture()).unwrap();
    let evt = calc_stats(file.events());
    let fsc = evt.get(Channel::FscSmall).unwrap();
    assert_close(fsc.max, 1652.0286629483903);
    assert_close(fsc.mean, 2.8114101351566445);
    assert_close(fsc.min, 1.0);
    let pe = evt.get(Channel::Pe).unwrap();
    assert_close(pe.max, 1779.1855898687629);
    assert_close(pe.mean, 8.329553221519069);

    let mut engine = GatingEngine::new(&file);
    engine.gate(&FilterOptions::new(0.5, 0.0)).unwrap();
    let opp = engine.opp_stats().unwrap();
    let expected = [
        (Channel::FscSmall, 1.1612919251372618, 1166.1984528866317, 23.187903329680267),
        (Channel::FscPerp, 58.340254959965897, 58.642349877876896, 58.42582313084556),
        (Channel::FscBig, 1.4249794251756174, 3.380108678220699, 2.2238485381723674),
        (Channel::Pe, 1.0, 1269.1578052463431, 74.84328753100617),
        (Channel::ChlSmall, 1.3345760374616036, 922.19096252450186, 22.266367429741198),
        (Channel::ChlBig, 53.357532766135428, 53.64042220069004, 53.46595431797728),
    ];
    for (channel, min, max, mean) in expected {
        let stat = opp.get(channel).unwrap();
        assert_close(stat.min, min);
        assert_close(stat.max, max);
        assert_close(stat.mean, mean);
    }
}
