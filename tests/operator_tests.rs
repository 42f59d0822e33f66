#[cfg(test)]
mod tests {
    use loratrace::operators::{
        CustomOperator, OperatorMatcher, PRIVATE_OPERATOR, UNKNOWN_OPERATOR,
    };

    #[test]
    fn test_builtin_netid_assignments() {
        let matcher = OperatorMatcher::new(&[]);
        assert_eq!(matcher.match_dev_addr("26011AAB"), "The Things Network");
        assert_eq!(matcher.match_dev_addr("27000000"), "The Things Network");
        assert_eq!(matcher.match_dev_addr("78ABCDEF"), "Helium");
        assert_eq!(matcher.match_dev_addr("00000001"), "Experimental");
        assert_eq!(matcher.match_dev_addr("FD000000"), UNKNOWN_OPERATOR);
    }

    #[test]
    fn test_priority_beats_specificity() {
        // a /7 custom rule at priority 200 outranks a /16 at priority 100
        let matcher = OperatorMatcher::new(&[
            CustomOperator {
                prefixes: vec!["26000000/7".into()],
                name: "HighPriority".into(),
                priority: Some(200),
                color: None,
            },
            CustomOperator {
                prefixes: vec!["26010000/16".into()],
                name: "MoreSpecific".into(),
                priority: Some(100),
                color: None,
            },
        ]);
        assert_eq!(matcher.match_dev_addr("26011AAB"), "HighPriority");
    }

    #[test]
    fn test_equal_priority_specificity_wins() {
        let matcher = OperatorMatcher::new(&[
            CustomOperator {
                prefixes: vec!["26000000/7".into()],
                name: "Wide".into(),
                priority: Some(100),
                color: None,
            },
            CustomOperator {
                prefixes: vec!["26011A00/24".into()],
                name: "Narrow".into(),
                priority: Some(100),
                color: None,
            },
        ]);
        assert_eq!(matcher.match_dev_addr("26011AAB"), "Narrow");
        assert_eq!(matcher.match_dev_addr("26020000"), "Wide");
    }

    #[test]
    fn test_join_eui_resolution() {
        let matcher = OperatorMatcher::new(&[]);
        assert_eq!(
            matcher.match_join_eui("70B3D57ED0000001"),
            "The Things Network"
        );
        // all-printable-ASCII JoinEUI reads as a private join server
        assert_eq!(matcher.match_join_eui("4A4F494E53525652"), PRIVATE_OPERATOR);
        assert_eq!(
            matcher.match_join_eui("FFFF000000000000"),
            UNKNOWN_OPERATOR
        );
    }
}
